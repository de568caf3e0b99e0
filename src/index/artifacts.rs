//! The persisted artifact set shared by the index builder and the matcher.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::matrix::{EmbeddingMatrix, MatrixStorage, MatrixStorageError};
use crate::catalog::{self, Product};

pub const PRODUCTS_FILE: &str = "products.json";
pub const PRODUCT_EMBEDDINGS_FILE: &str = "product_embeddings.bin";
pub const IMAGE_EMBEDDINGS_FILE: &str = "image_embeddings.bin";
pub const IMAGE_INDEX_FILE: &str = "image_index.json";

/// Position of a product in the catalog and in the product-embedding matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductRef(usize);

impl ProductRef {
    pub fn new(position: usize) -> Self {
        Self(position)
    }

    pub fn position(self) -> usize {
        self.0
    }
}

/// One row of `image_index.json`, parallel to the image-embedding matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageIndexEntry {
    pub product_idx: ProductRef,
    pub file: String,
    pub price: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("missing artifact {0}; run `vpm build` first")]
    Missing(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("catalog: {0:#}")]
    Catalog(anyhow::Error),

    #[error("matrix storage: {0}")]
    Storage(#[from] MatrixStorageError),

    #[error("inconsistent artifacts: {0}")]
    Invariant(String),
}

/// Catalog plus embeddings, immutable once loaded.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub products: Vec<Product>,
    pub product_embeddings: EmbeddingMatrix,
    pub image_embeddings: EmbeddingMatrix,
    pub image_index: Vec<ImageIndexEntry>,
    /// Image rows owned by each product, in index order.
    images_by_product: Vec<Vec<usize>>,
}

impl Artifacts {
    /// Assemble and check row alignment between the catalog, both matrices and
    /// the image index.
    pub fn new(
        products: Vec<Product>,
        product_embeddings: EmbeddingMatrix,
        image_embeddings: EmbeddingMatrix,
        image_index: Vec<ImageIndexEntry>,
    ) -> Result<Self, ArtifactError> {
        let mut artifacts = Self {
            products,
            product_embeddings,
            image_embeddings,
            image_index,
            images_by_product: Vec::new(),
        };
        artifacts.validate()?;
        artifacts.images_by_product = artifacts.group_images();
        Ok(artifacts)
    }

    fn validate(&self) -> Result<(), ArtifactError> {
        if self.product_embeddings.rows() != self.products.len() {
            return Err(ArtifactError::Invariant(format!(
                "{} product embeddings for {} products",
                self.product_embeddings.rows(),
                self.products.len()
            )));
        }

        if self.image_embeddings.rows() != self.image_index.len() {
            return Err(ArtifactError::Invariant(format!(
                "{} image embeddings for {} image index entries",
                self.image_embeddings.rows(),
                self.image_index.len()
            )));
        }

        if self.image_embeddings.dimensions() != self.product_embeddings.dimensions() {
            return Err(ArtifactError::Invariant(format!(
                "image embeddings have {} dimensions, product embeddings {}",
                self.image_embeddings.dimensions(),
                self.product_embeddings.dimensions()
            )));
        }

        if let Some((row, entry)) = self
            .image_index
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.product_idx.position() >= self.products.len())
        {
            return Err(ArtifactError::Invariant(format!(
                "image index row {row} ({}) points at product {} of {}",
                entry.file,
                entry.product_idx.position(),
                self.products.len()
            )));
        }

        Ok(())
    }

    fn group_images(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.products.len()];
        for (row, entry) in self.image_index.iter().enumerate() {
            groups[entry.product_idx.position()].push(row);
        }
        groups
    }

    pub fn dimensions(&self) -> usize {
        self.product_embeddings.dimensions()
    }

    pub fn product(&self, product: ProductRef) -> &Product {
        &self.products[product.position()]
    }

    pub fn product_refs(&self) -> impl Iterator<Item = ProductRef> {
        (0..self.products.len()).map(ProductRef::new)
    }

    pub fn product_embedding(&self, product: ProductRef) -> &[f32] {
        self.product_embeddings
            .row(product.position())
            .unwrap_or_default()
    }

    /// Image index rows belonging to `product`.
    pub fn image_rows(&self, product: ProductRef) -> &[usize] {
        self.images_by_product
            .get(product.position())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Load all four files from `dir`.
    pub fn load(dir: &Path, model_id: &[u8; 32], dimensions: usize) -> Result<Self, ArtifactError> {
        let paths = ArtifactPaths::new(dir);
        for path in paths.all() {
            if !path.exists() {
                return Err(ArtifactError::Missing(path.to_path_buf()));
            }
        }

        let products = catalog::load_catalog(&paths.products).map_err(ArtifactError::Catalog)?;
        let product_embeddings =
            MatrixStorage::new(paths.product_embeddings).load(model_id, dimensions)?;
        let image_embeddings =
            MatrixStorage::new(paths.image_embeddings).load(model_id, dimensions)?;
        let image_index: Vec<ImageIndexEntry> =
            serde_json::from_slice(&std::fs::read(&paths.image_index)?)?;

        let artifacts = Self::new(products, product_embeddings, image_embeddings, image_index)?;

        log::info!(
            "loaded {} products, {} images ({} dimensions) from {}",
            artifacts.products.len(),
            artifacts.image_index.len(),
            dimensions,
            dir.display()
        );

        Ok(artifacts)
    }

    /// Write the three derived artifacts into `dir`, replacing previous ones.
    /// The catalog itself is left untouched.
    pub fn save(&self, dir: &Path, model_id: &[u8; 32]) -> Result<(), ArtifactError> {
        let paths = ArtifactPaths::new(dir);

        MatrixStorage::new(paths.product_embeddings).save(&self.product_embeddings, model_id)?;
        MatrixStorage::new(paths.image_embeddings).save(&self.image_embeddings, model_id)?;

        let index_json = serde_json::to_vec_pretty(&self.image_index)?;
        write_atomic(&paths.image_index, &index_json)?;

        Ok(())
    }
}

/// Replace `path` with `bytes`: temp file -> fsync -> rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");

    let result = std::fs::File::create(&temp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(err) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    std::fs::rename(&temp_path, path)
}

struct ArtifactPaths {
    products: PathBuf,
    product_embeddings: PathBuf,
    image_embeddings: PathBuf,
    image_index: PathBuf,
}

impl ArtifactPaths {
    fn new(dir: &Path) -> Self {
        Self {
            products: dir.join(PRODUCTS_FILE),
            product_embeddings: dir.join(PRODUCT_EMBEDDINGS_FILE),
            image_embeddings: dir.join(IMAGE_EMBEDDINGS_FILE),
            image_index: dir.join(IMAGE_INDEX_FILE),
        }
    }

    fn all(&self) -> [&Path; 4] {
        [
            &self.products,
            &self.product_embeddings,
            &self.image_embeddings,
            &self.image_index,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;

    fn product(id: u64) -> Product {
        serde_json::from_value(serde_json::json!({"id": id, "name": format!("p{id}"), "images": []}))
            .unwrap()
    }

    fn matrix(rows: &[[f32; 2]]) -> EmbeddingMatrix {
        let mut m = EmbeddingMatrix::new(2);
        for row in rows {
            m.push_row(row).unwrap();
        }
        m
    }

    fn entry(product_idx: usize, file: &str) -> ImageIndexEntry {
        ImageIndexEntry {
            product_idx: ProductRef::new(product_idx),
            file: file.to_string(),
            price: "None".to_string(),
        }
    }

    #[test]
    fn test_groups_images_by_product() {
        let artifacts = Artifacts::new(
            vec![product(1), product(2)],
            matrix(&[[1.0, 0.0], [0.0, 1.0]]),
            matrix(&[[1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]),
            vec![entry(1, "b1.jpg"), entry(0, "a.jpg"), entry(1, "b2.jpg")],
        )
        .unwrap();

        assert_eq!(artifacts.image_rows(ProductRef::new(0)), &[1]);
        assert_eq!(artifacts.image_rows(ProductRef::new(1)), &[0, 2]);
        assert!(artifacts.image_rows(ProductRef::new(7)).is_empty());
    }

    #[test]
    fn test_rejects_product_row_mismatch() {
        let result = Artifacts::new(
            vec![product(1), product(2)],
            matrix(&[[1.0, 0.0]]),
            matrix(&[]),
            vec![],
        );
        assert!(matches!(result, Err(ArtifactError::Invariant(_))));
    }

    #[test]
    fn test_rejects_image_row_mismatch() {
        let result = Artifacts::new(
            vec![product(1)],
            matrix(&[[1.0, 0.0]]),
            matrix(&[[1.0, 0.0]]),
            vec![],
        );
        assert!(matches!(result, Err(ArtifactError::Invariant(_))));
    }

    #[test]
    fn test_rejects_dangling_product_ref() {
        let result = Artifacts::new(
            vec![product(1)],
            matrix(&[[1.0, 0.0]]),
            matrix(&[[1.0, 0.0]]),
            vec![entry(3, "ghost.jpg")],
        );
        assert!(matches!(result, Err(ArtifactError::Invariant(msg)) if msg.contains("ghost.jpg")));
    }

    #[test]
    fn test_image_index_json_shape() {
        let json = serde_json::to_value(entry(4, "x.jpg")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"product_idx": 4, "file": "x.jpg", "price": "None"})
        );
    }

    #[test]
    fn test_load_reports_missing_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let result = Artifacts::load(tmp.path(), &[0; 32], 2);
        assert!(matches!(result, Err(ArtifactError::Missing(_))));
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let products = vec![product(1), product(2)];
        std::fs::write(
            tmp.path().join(PRODUCTS_FILE),
            serde_json::to_vec(&products).unwrap(),
        )
        .unwrap();

        let artifacts = Artifacts::new(
            products,
            matrix(&[[0.6, 0.8], [0.0, 0.0]]),
            matrix(&[[0.6, 0.8]]),
            vec![entry(0, "a.jpg")],
        )
        .unwrap();
        artifacts.save(tmp.path(), &[7; 32]).unwrap();

        let loaded = Artifacts::load(tmp.path(), &[7; 32], 2).unwrap();
        assert_eq!(loaded.products, artifacts.products);
        assert_eq!(loaded.product_embeddings, artifacts.product_embeddings);
        assert_eq!(loaded.image_index, artifacts.image_index);
        assert_eq!(loaded.image_rows(ProductRef::new(0)), &[0]);
        assert!(!tmp.path().join("image_index.tmp").exists());
    }

    #[test]
    fn test_load_reports_malformed_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts =
            Artifacts::new(vec![product(1)], matrix(&[[1.0, 0.0]]), matrix(&[]), vec![]).unwrap();
        artifacts.save(tmp.path(), &[7; 32]).unwrap();
        std::fs::write(tmp.path().join(PRODUCTS_FILE), "[{\"id\": 1,").unwrap();

        let err = Artifacts::load(tmp.path(), &[7; 32], 2).unwrap_err();
        assert!(matches!(err, ArtifactError::Catalog(_)));
        assert!(err.to_string().contains("malformed"));
    }
}
