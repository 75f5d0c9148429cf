//! Normalization of loosely-typed scraped values into metric fields.
//!
//! Providers hand back numbers, strings like `"$1,234.56"` or `"#1,234 in Toys"`,
//! or nothing at all. Anything that cannot be read becomes `None`.

use serde_json::Value as JsonValue;
use tracing::debug;

pub fn price(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | '₹') && !c.is_whitespace())
                .collect();
            let normalized = if cleaned.contains(',') && cleaned.contains('.') {
                cleaned.replace(',', "")
            } else if cleaned.matches(',').count() == 1 {
                match cleaned.split_once(',') {
                    // "49,99" is a decimal comma, "1,234" a thousands separator.
                    Some((_, cents)) if cents.len() <= 2 => cleaned.replace(',', "."),
                    _ => cleaned.replace(',', ""),
                }
            } else {
                cleaned.replace(',', "")
            };
            let parsed = normalized.parse::<f64>().ok();
            if parsed.is_none() {
                debug!(raw = %s, "unreadable price");
            }
            parsed
        }
        _ => None,
    }
}

/// Ratings are reported on a five-star scale; values up to 100 are treated as
/// percentages.
pub fn rating(value: &JsonValue) -> Option<f64> {
    let raw = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => leading_number(&s.replace(',', "."))?,
        _ => return None,
    };
    if raw <= 5.0 {
        Some(raw)
    } else if raw <= 100.0 {
        Some(raw / 100.0 * 5.0)
    } else {
        None
    }
}

pub fn rank(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => {
            let digits: String = s
                .replace(['#', ','], "")
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Accepts `"1,234 ratings"`, `"1.2K"` and `"2.5M"` forms.
pub fn review_count(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => {
            let cleaned = s.replace(',', "");
            let (number, rest) = split_leading_number(&cleaned)?;
            let multiplier = match rest.trim_start().chars().next() {
                Some('k' | 'K') => 1_000.0,
                Some('m' | 'M') => 1_000_000.0,
                _ => 1.0,
            };
            let count = (number * multiplier).round();
            if count.is_finite() && count >= 0.0 && count <= f64::from(u32::MAX) {
                Some(count as u32)
            } else {
                None
            }
        }
        _ => None,
    }
}

pub fn availability(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => {
            let lower = s.to_lowercase();
            if lower.contains("out of stock") || lower.contains("unavailable") {
                Some(false)
            } else if lower.contains("in stock")
                || lower.contains("available")
                || lower.contains("limited")
                || lower.contains("left")
            {
                Some(!lower.starts_with('0'))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn leading_number(s: &str) -> Option<f64> {
    split_leading_number(s).map(|(number, _)| number)
}

fn split_leading_number(s: &str) -> Option<(f64, &str)> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let tail = &s[start..];
    let end = tail
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(tail.len());
    let number = tail[..end].trim_end_matches('.').parse().ok()?;
    Some((number, &tail[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prices_in_common_formats() {
        assert_eq!(price(&json!("$49.99")), Some(49.99));
        assert_eq!(price(&json!("49,99 €")), Some(49.99));
        assert_eq!(price(&json!("1,234.56")), Some(1234.56));
        assert_eq!(price(&json!("1,234")), Some(1234.0));
        assert_eq!(price(&json!(12)), Some(12.0));
        assert_eq!(price(&json!("call for price")), None);
        assert_eq!(price(&JsonValue::Null), None);
    }

    #[test]
    fn ratings_ranks_and_counts() {
        assert_eq!(rating(&json!("4.5 out of 5 stars")), Some(4.5));
        assert_eq!(rating(&json!("4,5")), Some(4.5));
        assert!((rating(&json!(92)).unwrap() - 4.6).abs() < 1e-9);
        assert_eq!(rating(&json!(500)), None);

        assert_eq!(rank(&json!("#1,234 in Electronics")), Some(1234));
        assert_eq!(rank(&json!(77)), Some(77));

        assert_eq!(review_count(&json!("1,234 customer reviews")), Some(1234));
        assert_eq!(review_count(&json!("1.2K")), Some(1200));
        assert_eq!(review_count(&json!("2.5M")), Some(2_500_000));
        assert_eq!(review_count(&json!("87 ratings from customers")), Some(87));
    }

    #[test]
    fn availability_strings() {
        assert_eq!(availability(&json!("In Stock.")), Some(true));
        assert_eq!(availability(&json!("Currently unavailable")), Some(false));
        assert_eq!(availability(&json!("Only 3 left in stock")), Some(true));
        assert_eq!(availability(&json!("ships soon")), None);
    }
}
