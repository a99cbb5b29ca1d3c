use regex::Regex;
use std::sync::LazyLock;

// "$120K/yr" or "$120K/yr - $150K/yr", nothing else.
static YEARLY_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\$\s*([\d,]+)\s*k\s*/\s*yr(?:\s*-\s*\$\s*([\d,]+)\s*k\s*/\s*yr)?$")
        .expect("salary pattern is valid")
});

/// Parse a yearly salary string into `(min, max)` in whole currency units.
///
/// Only the `$<N>K/yr` form (optionally a `- $<M>K/yr` range) is recognized.
/// Anything else yields `(None, None)`; this never fails and never guesses.
pub fn parse_salary(text: Option<&str>) -> (Option<i64>, Option<i64>) {
    let Some(text) = text else {
        return (None, None);
    };

    let Some(caps) = YEARLY_RANGE.captures(text.trim()) else {
        return (None, None);
    };

    let Some(low) = caps.get(1).and_then(|m| thousands(m.as_str())) else {
        return (None, None);
    };

    let high = match caps.get(2) {
        Some(m) => match thousands(m.as_str()) {
            Some(v) => v,
            None => return (None, None),
        },
        None => low,
    };

    if low > high {
        (Some(high), Some(low))
    } else {
        (Some(low), Some(high))
    }
}

fn thousands(raw: &str) -> Option<i64> {
    let digits: String = raw.chars().filter(|c| *c != ',').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok()?.checked_mul(1000)
}
