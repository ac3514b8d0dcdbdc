//! Value conversions shared by the Invision Community policies.
//!
//! Invision stores timestamps as unix seconds, money as JSON documents keyed
//! by currency, and post bodies as HTML with a few proprietary
//! placeholders.

use crate::error::RecordError;
use crate::migration::source::SourceRow;
use crate::migration::target::Fields;
use chrono::DateTime;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));
static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static EMPTY_PARAGRAPH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<p>(\s|&nbsp;|<br\s*/?>)*</p>").expect("valid regex")
});

const BASE_URL_PLACEHOLDER: &str = "<___base_url___>";

/// Unwrap a `json!({...})` literal into target fields.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    }
}

/// Unix-seconds column as an RFC 3339 timestamp. Zero means "never".
pub fn timestamp(row: &SourceRow, column: &str) -> Result<Option<String>, RecordError> {
    match row.opt_i64(column)? {
        None | Some(0) => Ok(None),
        Some(seconds) => DateTime::from_timestamp(seconds, 0)
            .map(|at| Some(at.to_rfc3339()))
            .ok_or_else(|| RecordError::invalid_field(column, format!("{} is out of range", seconds))),
    }
}

/// Lower-case, dash-separated slug. Empty when `text` has no letters or
/// digits.
pub fn slugify(text: &str) -> String {
    NON_SLUG
        .replace_all(&text.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Prefer the stored SEO name, fall back to a slug of `title`, then to
/// `<fallback>-<id>`.
pub fn slug_for(row: &SourceRow, seo_column: &str, title: &str, fallback: &str, id: i64) -> String {
    let slug = row
        .opt_str(seo_column)
        .map(slugify)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| slugify(title));
    if slug.is_empty() {
        format!("{}-{}", fallback, id)
    } else {
        slug
    }
}

/// Strip Invision-only markup from stored HTML. Everything else passes
/// through untouched.
pub fn clean_html(html: &str) -> String {
    let html = HTML_COMMENT.replace_all(html, "");
    let html = html.replace(BASE_URL_PLACEHOLDER, "");
    EMPTY_PARAGRAPH.replace_all(&html, "").trim().to_string()
}

/// An amount in minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Money {
    pub currency: String,
    pub cents: i64,
}

fn parse_amount(field: &str, value: &Value) -> Result<i64, RecordError> {
    let amount = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| RecordError::invalid_field(field, format!("invalid amount {}", value)))?;
    Ok((amount * 100.0).round() as i64)
}

/// Columns holding JSON are sometimes exported as text.
pub fn json_column(row: &SourceRow, column: &str) -> Result<Value, RecordError> {
    match row.get(column) {
        Value::String(text) if text.trim().is_empty() => Ok(Value::Null),
        Value::String(text) => serde_json::from_str(text)
            .map_err(|err| RecordError::invalid_field(column, format!("invalid JSON: {}", err))),
        other => Ok(other.clone()),
    }
}

/// Parse a `{"USD": {"amount": "10.00", "currency": "USD"}}` document.
/// Currencies come back in document order.
pub fn parse_money(field: &str, value: &Value) -> Result<Vec<Money>, RecordError> {
    let entries = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Object(entries) => entries,
        other => {
            return Err(RecordError::invalid_field(
                field,
                format!("expected a currency map, got {}", other),
            ));
        }
    };

    entries
        .iter()
        .map(|(currency, price)| {
            let amount = match price {
                Value::Object(price) => price.get("amount").unwrap_or(&Value::Null),
                other => other,
            };
            Ok(Money {
                currency: currency.to_uppercase(),
                cents: parse_amount(field, amount)?,
            })
        })
        .collect()
}

/// Plain amount column (`"12.50"` or `12.5`) in minor units.
pub fn cents(row: &SourceRow, column: &str) -> Result<i64, RecordError> {
    match row.get(column) {
        Value::Null => Ok(0),
        value => parse_amount(column, value),
    }
}

/// Invision renewal unit to an interval name.
pub fn interval(unit: &str) -> Option<&'static str> {
    match unit {
        "d" => Some("day"),
        "w" => Some("week"),
        "m" => Some("month"),
        "y" => Some("year"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> SourceRow {
        SourceRow::new(fields(value))
    }

    #[test]
    fn test_timestamp_conversion() {
        let row = row(json!({"joined": 1_700_000_000, "last_visit": 0}));
        assert_eq!(
            timestamp(&row, "joined").unwrap().as_deref(),
            Some("2023-11-14T22:13:20+00:00")
        );
        assert_eq!(timestamp(&row, "last_visit").unwrap(), None);
        assert_eq!(timestamp(&row, "missing").unwrap(), None);
    }

    #[test]
    fn test_slugs() {
        assert_eq!(slugify("  Hello, World! "), "hello-world");
        assert_eq!(slugify("!!!"), "");

        let r = row(json!({"name_seo": ""}));
        assert_eq!(slug_for(&r, "name_seo", "General Chat", "forum", 3), "general-chat");
        assert_eq!(slug_for(&r, "name_seo", "???", "forum", 3), "forum-3");
    }

    #[test]
    fn test_clean_html_removes_invision_markup() {
        let html = "<p>Hi <!-- x --></p><p>&nbsp;</p><a href=\"<___base_url___>/topic/1\">t</a>";
        assert_eq!(clean_html(html), "<p>Hi </p><a href=\"/topic/1\">t</a>");
    }

    #[test]
    fn test_parse_money_from_text_column() {
        let r = row(json!({"p_base_price": "{\"usd\":{\"amount\":\"10.50\",\"currency\":\"USD\"}}"}));
        let value = json_column(&r, "p_base_price").unwrap();
        assert_eq!(
            parse_money("p_base_price", &value).unwrap(),
            vec![Money {
                currency: "USD".into(),
                cents: 1050
            }]
        );
        assert!(parse_money("p_base_price", &json!([1])).is_err());
        assert!(parse_money("p_base_price", &Value::Null).unwrap().is_empty());
    }
}
