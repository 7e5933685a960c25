use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static LINE_BREAKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\n\s*").unwrap());

/// One harvested listing. `id` is stable across pages and runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub title: String,
    pub price: Option<String>,
    pub specifications: Vec<String>,
    pub city: String,
    pub link: Option<String>,
}

/// Field values as they come out of the rendered card, before the field policy is applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawListing {
    pub id: Option<String>,
    pub title: Option<String>,
    pub price: Option<String>,
    #[serde(default)]
    pub specifications: Option<Vec<String>>,
    pub city: Option<String>,
    pub link: Option<String>,
}

impl RawListing {
    /// Field policy:
    ///
    /// | field          | absent            |
    /// |----------------|-------------------|
    /// | id             | skip record       |
    /// | title          | skip record       |
    /// | city           | skip record       |
    /// | price          | `None`            |
    /// | link           | `None`            |
    /// | specifications | empty list        |
    pub fn into_record(self) -> Option<Record> {
        let id = required(self.id)?;
        let title = required(self.title)?;
        let city = required(self.city)?;

        Some(Record {
            id,
            title,
            price: optional(self.price).map(|p| normalize_price(&p)),
            specifications: self
                .specifications
                .unwrap_or_default()
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            city,
            link: optional(self.link),
        })
    }
}

/// Convert a batch of raw cards, dropping the ones that fail the field policy.
pub fn from_raw_batch(raw: Vec<RawListing>) -> Vec<Record> {
    raw.into_iter().filter_map(RawListing::into_record).collect()
}

fn required(value: Option<String>) -> Option<String> {
    optional(value)
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Prices render across several lines ("1 200 000\nDA"); keep them on one.
fn normalize_price(price: &str) -> String {
    LINE_BREAKS.replace_all(price, " ").to_string()
}
