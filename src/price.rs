//! Catalog price parsing and price-range filtering.
//!
//! Prices arrive as numbers, numeric strings or currency-formatted strings
//! ("₹1,299"). Anything that does not parse is an *unknown* price, which is a
//! normal state rather than an error.

use serde::{Deserialize, Serialize};

const CURRENCY_GLYPHS: &[&str] = &["₹", "â‚¹"];

/// A price exactly as it appears in `products.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Number(serde_json::Number),
    Text(String),
    #[default]
    Null,
}

impl RawPrice {
    /// Stringified form stored in the image index. Null becomes "None", which
    /// keeps image_index.json compatible with indexes built by older tooling.
    pub fn to_index_string(&self) -> String {
        match self {
            RawPrice::Number(n) => n.to_string(),
            RawPrice::Text(s) => s.clone(),
            RawPrice::Null => "None".to_string(),
        }
    }

    pub fn parse(&self) -> Option<f64> {
        match self {
            RawPrice::Number(n) => n.as_f64(),
            RawPrice::Text(s) => parse_price(s),
            RawPrice::Null => None,
        }
    }
}

/// Parse a price string, stripping thousands separators and the rupee glyph.
///
/// `"inf"` parses to infinity so an upper bound still excludes it; `"nan"`
/// is treated as unknown.
pub fn parse_price(raw: &str) -> Option<f64> {
    let mut cleaned = raw.replace(',', "");
    for glyph in CURRENCY_GLYPHS {
        cleaned = cleaned.replace(glyph, "");
    }

    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    cleaned.parse::<f64>().ok().filter(|p| !p.is_nan())
}

/// Optional inclusive bounds applied to image prices.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl PriceRange {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// Whether an image with this price survives the filter.
    ///
    /// An unknown price is admitted by every range. Whether that leniency is
    /// intended is an open question; it is kept as-is.
    pub fn admits(&self, price: Option<f64>) -> bool {
        let Some(price) = price else {
            return true;
        };
        if self.min.is_some_and(|min| price < min) {
            return false;
        }
        if self.max.is_some_and(|max| price > max) {
            return false;
        }
        true
    }
}
