//! Offline index builder.
//!
//! Walks the catalog in order, embeds every image found under the data
//! directory and produces the artifact set consumed by the matcher. Missing or
//! undecodable images are skipped with a warning; a product left without any
//! image gets a zero-vector row so the matrices stay aligned with the catalog.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use indicatif::ProgressBar;
use rayon::prelude::*;

use super::artifacts::{ArtifactError, Artifacts, ImageIndexEntry, ProductRef};
use super::matrix::EmbeddingMatrix;
use crate::catalog::{ImageRecord, Product};
use crate::embeddings::{l2_normalize, ImageEmbedder};

/// Counters collected while building, logged at the end of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub products: usize,
    pub images_indexed: usize,
    pub images_skipped: usize,
    /// Indexed images whose price is missing or unparsable; they pass every
    /// price filter at query time.
    pub images_unpriced: usize,
    /// Ids of products that ended up with the zero-vector sentinel.
    pub empty_products: Vec<serde_json::Value>,
}

pub struct IndexBuilder<'a> {
    embedder: &'a dyn ImageEmbedder,
    image_root: PathBuf,
    progress: Option<ProgressBar>,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(embedder: &'a dyn ImageEmbedder, image_root: impl Into<PathBuf>) -> Self {
        Self {
            embedder,
            image_root: image_root.into(),
            progress: None,
        }
    }

    /// Tick `progress` once per product.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn build(&self, products: Vec<Product>) -> Result<(Artifacts, BuildReport), ArtifactError> {
        let dimensions = self.embedder.dimensions();
        let mut product_embeddings = EmbeddingMatrix::with_capacity(dimensions, products.len());
        let mut image_embeddings = EmbeddingMatrix::new(dimensions);
        let mut image_index = Vec::new();
        let mut report = BuildReport {
            products: products.len(),
            ..Default::default()
        };

        for (position, product) in products.iter().enumerate() {
            let product_ref = ProductRef::new(position);
            let records = product.image_records();

            // decoding is independent per file; embedding goes through the
            // single model session
            let decoded: Vec<Option<DynamicImage>> = records
                .par_iter()
                .map(|record| self.load_image(record))
                .collect();

            let mut sum = vec![0f32; dimensions];
            let mut embedded = 0usize;

            for (record, image) in records.iter().zip(decoded) {
                let Some(image) = image else {
                    report.images_skipped += 1;
                    continue;
                };

                let mut embedding = match self.embedder.embed(&image) {
                    Ok(embedding) if embedding.len() == dimensions => embedding,
                    Ok(embedding) => {
                        log::warn!(
                            "embedding for {} has {} dimensions, expected {dimensions}; skipping",
                            record.file,
                            embedding.len()
                        );
                        report.images_skipped += 1;
                        continue;
                    }
                    Err(err) => {
                        log::warn!("failed encoding {}: {err}", record.file);
                        report.images_skipped += 1;
                        continue;
                    }
                };

                for (acc, value) in sum.iter_mut().zip(&embedding) {
                    *acc += value;
                }
                embedded += 1;

                if record.price.parse().is_none() {
                    log::debug!("{} has no usable price ({:?})", record.file, record.price);
                    report.images_unpriced += 1;
                }

                l2_normalize(&mut embedding);
                image_embeddings.push_row(&embedding)?;
                image_index.push(ImageIndexEntry {
                    product_idx: product_ref,
                    file: record.file.clone(),
                    price: record.price.to_index_string(),
                });
            }

            if embedded == 0 {
                log::warn!("no valid images for product {}; using zero vector", product.id);
                report.empty_products.push(product.id.clone());
                product_embeddings.push_row(&sum)?;
            } else {
                for value in sum.iter_mut() {
                    *value /= embedded as f32;
                }
                l2_normalize(&mut sum);
                product_embeddings.push_row(&sum)?;
            }
            report.images_indexed += embedded;

            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        }

        if let Some(progress) = &self.progress {
            progress.finish_and_clear();
        }

        let artifacts = Artifacts::new(products, product_embeddings, image_embeddings, image_index)?;

        log::info!(
            "built product_embeddings {}x{}, image_embeddings {}x{}, image_index {} entries ({} skipped)",
            artifacts.product_embeddings.rows(),
            dimensions,
            artifacts.image_embeddings.rows(),
            dimensions,
            artifacts.image_index.len(),
            report.images_skipped
        );

        Ok((artifacts, report))
    }

    fn load_image(&self, record: &ImageRecord) -> Option<DynamicImage> {
        let path = resolve_local(&self.image_root, &record.file);
        if !path.exists() {
            log::warn!("missing image {}; skipping this image", path.display());
            return None;
        }

        match image::open(&path) {
            Ok(image) => Some(DynamicImage::ImageRgb8(image.to_rgb8())),
            Err(err) => {
                log::warn!("failed decoding {}: {err}", path.display());
                None
            }
        }
    }
}

fn resolve_local(root: &Path, file: &str) -> PathBuf {
    root.join(file)
}
