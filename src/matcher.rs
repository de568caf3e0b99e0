//! Two-level similarity ranking over the loaded artifacts.
//!
//! Products are ranked by the cosine similarity between the query and their
//! aggregate embedding; each surviving product is then expanded into its
//! images, scored individually and filtered by price.

use serde::{Deserialize, Serialize};

use crate::index::{Artifacts, ProductRef};
use crate::price::{parse_price, PriceRange};

pub const DEFAULT_TOP_K: usize = 6;
pub const DEFAULT_THRESHOLD: f32 = 0.0;
pub const DEFAULT_STATIC_PREFIX: &str = "/static";

/// Ranking knobs for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    pub top_k: usize,
    pub threshold: f32,
    pub price: PriceRange,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_THRESHOLD,
            price: PriceRange::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMatch {
    pub file: String,
    pub price: Option<f64>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMatch {
    pub id: serde_json::Value,
    pub name: Option<String>,
    pub category: Option<String>,
    pub score: f32,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub images: Vec<ImageMatch>,
}

/// Ranks products against a normalized query embedding.
pub struct Matcher<'a> {
    artifacts: &'a Artifacts,
    static_prefix: &'a str,
}

impl<'a> Matcher<'a> {
    pub fn new(artifacts: &'a Artifacts, static_prefix: &'a str) -> Self {
        Self {
            artifacts,
            static_prefix,
        }
    }

    /// Product-level scores in descending order; ties keep catalog order.
    pub fn rank_products(&self, query: &[f32]) -> Vec<(ProductRef, f32)> {
        let mut ranked: Vec<(ProductRef, f32)> = self
            .artifacts
            .product_refs()
            .map(|product| {
                let score = cosine_similarity(query, self.artifacts.product_embedding(product));
                (product, score)
            })
            .collect();

        // sort_by is stable
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }

    pub fn find_matches(&self, query: &[f32], params: &MatchParams) -> Vec<ProductMatch> {
        let mut results = Vec::new();
        if params.top_k == 0 {
            return results;
        }

        for (product_ref, product_score) in self.rank_products(query) {
            if product_score < params.threshold {
                continue;
            }

            let rows = self.artifacts.image_rows(product_ref);
            if rows.is_empty() {
                continue;
            }

            let mut images: Vec<ImageMatch> = rows
                .iter()
                .filter_map(|&row| {
                    let entry = &self.artifacts.image_index[row];
                    let price = parse_price(&entry.price);
                    if !params.price.admits(price) {
                        return None;
                    }

                    let score = self
                        .artifacts
                        .image_embeddings
                        .row(row)
                        .filter(|embedding| embedding.len() == query.len())
                        .map(|embedding| cosine_similarity(query, embedding))
                        .unwrap_or(product_score);

                    Some(ImageMatch {
                        file: resolve_image_path(&entry.file, self.static_prefix),
                        price,
                        score,
                    })
                })
                .collect();

            if images.is_empty() {
                continue;
            }

            images.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

            let known_prices = || images.iter().filter_map(|image| image.price);
            let min_price = known_prices().reduce(f64::min);
            let max_price = known_prices().reduce(f64::max);

            let product = self.artifacts.product(product_ref);
            results.push(ProductMatch {
                id: product.id.clone(),
                name: product.name.clone(),
                category: product.category.clone(),
                score: product_score,
                min_price,
                max_price,
                images,
            });

            if results.len() >= params.top_k {
                break;
            }
        }

        results
    }
}

/// Cosine similarity; 0.0 when either side has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = crate::embeddings::l2_norm(a);
    let norm_b = crate::embeddings::l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

/// Absolute URLs pass through; catalog-relative files map under `static_prefix`.
pub fn resolve_image_path(file: &str, static_prefix: &str) -> String {
    if file.is_empty() {
        return String::new();
    }
    if file.starts_with("http://") || file.starts_with("https://") {
        return file.to_string();
    }
    format!(
        "{}/{}",
        static_prefix.trim_end_matches('/'),
        file.trim_start_matches('/')
    )
}
