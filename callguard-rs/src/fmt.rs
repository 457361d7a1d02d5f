//! Provides parsing and formatting helpers for durations.
//!
//! Durations show up in the settings (TTLs, reconnect delays, poll intervals) and in log lines
//! (how long a call waited for a slot). Both directions use the same compact notation.
use std::fmt::Write;
use std::time::Duration;

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms** or **MS**: treats the value as milliseconds
/// * **s** or **S**: treats the value as seconds
/// * **m** or **M**: treats the value as minutes
/// * **h** or **H**: treats the value as hours
/// * **d** or **D**: treats the value as days
///
/// A number without any suffix is treated as milliseconds. Returns an **Err** if either a
/// non-integer value is given or if an unknown suffix was provided.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(callguard::fmt::parse_duration("150 ms").unwrap(), Duration::from_millis(150));
/// assert_eq!(callguard::fmt::parse_duration("150").unwrap(), Duration::from_millis(150));
/// assert_eq!(callguard::fmt::parse_duration("60s").unwrap(), Duration::from_secs(60));
/// assert_eq!(callguard::fmt::parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(callguard::fmt::parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(callguard::fmt::parse_duration("1 d").unwrap(), Duration::from_secs(24 * 60 * 60));
///
/// // An invalid suffix results in an error...
/// assert_eq!(callguard::fmt::parse_duration("3 Y").is_err(), true);
///
/// // Decimal and negative numbers result in an error...
/// assert_eq!(callguard::fmt::parse_duration("1.5s").is_err(), true);
/// assert_eq!(callguard::fmt::parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_UNIT: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *((ms|s|m|h|d|MS|S|M|H|D)?) *$").unwrap();
    }

    let captures = NUMBER_AND_UNIT.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as unit.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    match &captures[2] {
        "s" | "S" => Ok(Duration::from_secs(number)),
        "m" | "M" => Ok(Duration::from_secs(number * 60)),
        "h" | "H" => Ok(Duration::from_secs(number * 60 * 60)),
        "d" | "D" => Ok(Duration::from_secs(number * 60 * 60 * 24)),
        _ => Ok(Duration::from_millis(number)),
    }
}

/// Formats a duration into a string like "1h 2m 3s 150ms".
///
/// Zero durations are rendered as "0ms" so that log lines never end up with an empty value.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(callguard::fmt::format_duration(Duration::ZERO), "0ms");
/// assert_eq!(callguard::fmt::format_duration(Duration::from_millis(150)), "150ms");
/// assert_eq!(callguard::fmt::format_duration(Duration::from_millis(1_150)), "1s 150ms");
/// assert_eq!(callguard::fmt::format_duration(Duration::from_secs(62)), "1m 2s");
/// assert_eq!(callguard::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(callguard::fmt::format_duration(Duration::from_secs(25 * 60 * 60)), "1d 1h");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (1000 * 60 * 60 * 24, "d"),
        (1000 * 60 * 60, "h"),
        (1000 * 60, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut result = String::new();
    let mut value = duration.as_millis();
    for (millis, unit) in UNITS {
        let amount = value / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            value %= millis;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}

#[cfg(test)]
mod tests {
    use crate::fmt::{format_duration, parse_duration};

    #[test]
    fn parsed_durations_format_back() {
        for expression in ["150ms", "2s", "1m 30s", "4h", "2d"] {
            let parsed: std::time::Duration = expression
                .split(' ')
                .map(|part| parse_duration(part).unwrap())
                .sum();
            assert_eq!(format_duration(parsed), expression);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10 weeks").is_err());
    }
}
