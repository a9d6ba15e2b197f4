use crate::error::TagError;
use regex::Regex;
use std::cmp::Ordering;

/// Derives a pattern from a concrete tag by turning every run of decimal digits into a
/// "one or more digits" wildcard, e.g. `1.14.2-nanoserver-1809` matches
/// `1.15.0-nanoserver-2004` but not `1.15.0-alpine`.
pub fn pattern_for(tag: &str) -> Result<Regex, TagError> {
    let mut pattern = String::from("^");
    let mut literal = String::new();
    let mut in_digits = false;

    for c in tag.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                pattern.push_str(&regex::escape(&literal));
                literal.clear();
                pattern.push_str("[0-9]+");
                in_digits = true;
            }
        } else {
            in_digits = false;
            literal.push(c);
        }
    }
    pattern.push_str(&regex::escape(&literal));
    pattern.push('$');

    Ok(Regex::new(&pattern)?)
}

/// Picks the greatest tag matching `pattern`, comparing the embedded integers left to
/// right. Equal integer sequences fall back to plain string order.
pub fn latest_matching<'a>(tags: &'a [String], pattern: &Regex) -> Result<&'a str, TagError> {
    tags.iter()
        .filter(|tag| pattern.is_match(tag))
        .max_by(|a, b| compare_tags(a, b))
        .map(String::as_str)
        .ok_or_else(|| TagError::NoMatchingTags {
            pattern: pattern.as_str().to_string(),
        })
}

fn compare_tags(a: &str, b: &str) -> Ordering {
    let a_numbers = digit_runs(a);
    let b_numbers = digit_runs(b);

    for (x, y) in a_numbers.iter().zip(b_numbers.iter()) {
        match compare_numeric(x, y) {
            Ordering::Equal => continue,
            ordering => return ordering,
        }
    }

    a_numbers
        .len()
        .cmp(&b_numbers.len())
        .then_with(|| a.cmp(b))
}

fn digit_runs(tag: &str) -> Vec<&str> {
    tag.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .collect()
}

// Digit runs can exceed u64 (build timestamps, long build numbers), so compare them as
// decimal strings: strip leading zeros, then a longer run is the bigger number.
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
