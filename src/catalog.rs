use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::price::RawPrice;

/// A product as listed in `products.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Kept as raw JSON so both numeric and string ids round-trip unchanged.
    /// A missing id is `null`.
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub images: Vec<CatalogImage>,
    /// Fallback price for images listed as bare file names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<RawPrice>,
}

/// An image entry: either `{"file": ..., "price": ...}` or a bare file name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CatalogImage {
    Record(ImageRecord),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub file: String,
    #[serde(default)]
    pub price: RawPrice,
}

impl Product {
    /// Image records with bare file names resolved against the product price.
    pub fn image_records(&self) -> Vec<ImageRecord> {
        self.images
            .iter()
            .map(|image| match image {
                CatalogImage::Record(record) => record.clone(),
                CatalogImage::File(file) => ImageRecord {
                    file: file.clone(),
                    price: self.price.clone().unwrap_or_default(),
                },
            })
            .collect()
    }
}

pub fn load_catalog(path: &Path) -> anyhow::Result<Vec<Product>> {
    use anyhow::Context;

    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let products: Vec<Product> = serde_json::from_slice(&data)
        .with_context(|| format!("{} is malformed", path.display()))?;

    Ok(products)
}
