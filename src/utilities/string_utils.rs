//! String and numeric parsing helpers.
//!
//! Specification values arrive as free-form strings ("8", "8 channels",
//! "-20"), so the validators and the fallback handler share these lenient
//! parsers.

use regex::Regex;
use once_cell::sync::Lazy;

static INTEGER_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+").unwrap());

/// Extract the first integer embedded in `text`, if any.
///
/// `"8 channels"` yields `Some(8)`, `"-20C"` yields `Some(-20)`.
pub fn first_integer(text: &str) -> Option<i64> {
    INTEGER_PATTERN
        .find(text)
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

/// Parse a specification value as a number.
///
/// The whole trimmed string must be numeric; embedded numbers are not
/// accepted here (use [`first_integer`] for that).
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Render a numeric bound the way specification values are written.
///
/// Whole numbers drop the fractional part (`16.0` → `"16"`).
pub fn format_bound(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_integer() {
        assert_eq!(first_integer("8"), Some(8));
        assert_eq!(first_integer("8 channels"), Some(8));
        assert_eq!(first_integer("about -20 C"), Some(-20));
        assert_eq!(first_integer("none"), None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 16 "), Some(16.0));
        assert_eq!(parse_number("2.5"), Some(2.5));
        assert_eq!(parse_number("16 ch"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn test_format_bound() {
        assert_eq!(format_bound(16.0), "16");
        assert_eq!(format_bound(-4.0), "-4");
        assert_eq!(format_bound(2.5), "2.5");
    }
}
