use regex::Regex;
use std::sync::OnceLock;

/// Extract an explicit attempt limit from a user request.
///
/// Recognized phrasings include "retry up to 5 times", "at most 3 attempts",
/// "maximum of 4 tries", and "2 attempts max". Returns `None` when the
/// request carries no directive, leaving the configured default in force.
pub fn parse_retry_limit(text: &str) -> Option<u32> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)retry\s+(?:up\s+to\s+)?(\d+)\s+times",
            r"(?i)at\s+most\s+(\d+)\s+(?:attempts?|retries|tries)",
            r"(?i)max(?:imum)?\s+(?:of\s+)?(\d+)\s+(?:attempts?|retries|tries)",
            r"(?i)(\d+)\s+(?:attempts?|retries|tries)\s+max(?:imum)?",
            r"(?i)up\s+to\s+(\d+)\s+(?:attempts?|retries|tries)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("retry pattern"))
        .collect()
    });

    for pattern in patterns {
        if let Some(caps) = pattern.captures(text) {
            if let Ok(n) = caps[1].parse::<u32>() {
                if n > 0 {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// Progress line for the code path: attempt counter with an open-ended
/// display when no limit is set.
pub fn format_attempt_progress(attempt: u32, limit: Option<u32>) -> String {
    match limit {
        Some(limit) => format!("Attempt {attempt}/{limit}"),
        None => format!("Attempt {attempt}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_up_to_n_times() {
        assert_eq!(parse_retry_limit("fix it, retry up to 5 times"), Some(5));
        assert_eq!(parse_retry_limit("Retry 3 times if needed"), Some(3));
    }

    #[test]
    fn parses_at_most_n_attempts() {
        assert_eq!(parse_retry_limit("at most 3 attempts please"), Some(3));
        assert_eq!(parse_retry_limit("use AT MOST 7 tries"), Some(7));
    }

    #[test]
    fn parses_maximum_variants() {
        assert_eq!(parse_retry_limit("maximum of 4 tries"), Some(4));
        assert_eq!(parse_retry_limit("2 attempts max"), Some(2));
        assert_eq!(parse_retry_limit("up to 6 retries"), Some(6));
    }

    #[test]
    fn ignores_unrelated_numbers_and_zero() {
        assert_eq!(parse_retry_limit("print the first 5 primes"), None);
        assert_eq!(parse_retry_limit("retry up to 0 times"), None);
        assert_eq!(parse_retry_limit(""), None);
    }

    #[test]
    fn formats_progress_with_and_without_limit() {
        assert_eq!(format_attempt_progress(2, Some(5)), "Attempt 2/5");
        assert_eq!(format_attempt_progress(4, None), "Attempt 4");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_positive_directive_parses(n in 1u32..10_000) {
                prop_assert_eq!(
                    parse_retry_limit(&format!("please retry up to {n} times")),
                    Some(n)
                );
                prop_assert_eq!(
                    parse_retry_limit(&format!("at most {n} attempts")),
                    Some(n)
                );
            }
        }
    }
}
