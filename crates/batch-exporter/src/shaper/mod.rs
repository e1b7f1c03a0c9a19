use chrono::Utc;
use serde_json::Value as Json;

use crate::row::Row;

mod events;

pub use events::{AdvancedResult, Audit, ResultEvent, ResultSet, TestDescriptor};

/// Turns one upstream event into zero or more flat rows. Must not fail.
pub trait RecordShaper: Send + Sync {
    fn shape(&self, event: &ResultEvent) -> Vec<Row>;
}

impl<F> RecordShaper for F
where
    F: Fn(&ResultEvent) -> Vec<Row> + Send + Sync,
{
    fn shape(&self, event: &ResultEvent) -> Vec<Row> {
        self(event)
    }
}

/// One row per audit, matching [`TableSchema::audit_results`].
///
/// [`TableSchema::audit_results`]: crate::sink::TableSchema::audit_results
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditShaper;

impl RecordShaper for AuditShaper {
    fn shape(&self, event: &ResultEvent) -> Vec<Row> {
        let Some(advanced) = &event.result.advanced else {
            return Vec::new();
        };
        let tested_at = Utc::now();
        advanced
            .audits
            .iter()
            .map(|audit| {
                Row::builder()
                    .field("score", coerce_int(&audit.score))
                    .field("raw_value", coerce_int(&audit.raw_value))
                    .field("name", event.test.name.as_str())
                    .field("type", audit.id.as_str())
                    .field("url", event.test.url.as_str())
                    .field("tested_at", tested_at)
                    .build()
            })
            .collect()
    }
}

/// Best-effort integer: whole numbers pass, fractions truncate toward zero,
/// strings yield their leading signed digits. Anything else is `-1`.
pub fn coerce_int(value: &Json) -> i64 {
    match value {
        Json::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(-1),
        Json::String(s) => leading_int(s).unwrap_or(-1),
        _ => -1,
    }
}

fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let n: i64 = digits[..end].parse().ok()?;
    Some(if negative { -n } else { n })
}
