//! Row-major embedding matrix and its binary file format.
//!
//! File format: product_embeddings.bin / image_embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Rows (repeated row_count times):
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + row_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Dense `rows x dimensions` matrix of f32 embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    data: Vec<f32>,
    dimensions: usize,
}

impl EmbeddingMatrix {
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            dimensions,
        }
    }

    pub fn with_capacity(dimensions: usize, rows: usize) -> Self {
        Self {
            data: Vec::with_capacity(dimensions * rows),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn rows(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn push_row(&mut self, row: &[f32]) -> Result<(), MatrixStorageError> {
        if row.len() != self.dimensions {
            return Err(MatrixStorageError::DimensionMismatch {
                expected: self.dimensions,
                got: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    pub fn row(&self, idx: usize) -> Option<&[f32]> {
        let start = idx.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    #[cfg(test)]
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum MatrixStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file was built with a different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Reads and writes one matrix file.
pub struct MatrixStorage {
    path: PathBuf,
}

impl MatrixStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[cfg(test)]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the matrix, rejecting files built by another model or with
    /// another dimensionality.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<EmbeddingMatrix, MatrixStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        Self::validate_header(&header, expected_model_id, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let rows = usize::try_from(header.row_count)
            .map_err(|_| MatrixStorageError::InvalidFormat("row count overflows usize".into()))?;
        let mut matrix = EmbeddingMatrix::with_capacity(dimensions, rows);

        let mut row = vec![0f32; dimensions];
        let mut float_bytes = [0u8; 4];
        for _ in 0..rows {
            for value in row.iter_mut() {
                reader.read_exact(&mut float_bytes)?;
                *value = f32::from_le_bytes(float_bytes);
            }
            matrix.push_row(&row)?;
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(MatrixStorageError::InvalidFormat(format!(
                "trailing bytes after {rows} rows"
            )));
        }

        Ok(matrix)
    }

    /// Save the matrix.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        matrix: &EmbeddingMatrix,
        model_id: &[u8; 32],
    ) -> Result<(), MatrixStorageError> {
        let dimensions = u16::try_from(matrix.dimensions()).map_err(|_| {
            MatrixStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                matrix.dimensions()
            ))
        })?;

        let temp_path = self.path.with_extension("tmp");

        let result = Self::write_to_file(&temp_path, matrix, dimensions, model_id);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn write_to_file(
        path: &Path,
        matrix: &EmbeddingMatrix,
        dimensions: u16,
        model_id: &[u8; 32],
    ) -> Result<(), MatrixStorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            row_count: matrix.rows() as u64,
        };
        writer.write_all(&header.to_bytes())?;

        for &value in &matrix.data {
            writer.write_all(&value.to_le_bytes())?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, MatrixStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                MatrixStorageError::InvalidFormat("file shorter than header".into())
            }
            _ => e.into(),
        })?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION {
            return Err(MatrixStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([
            header_bytes[43],
            header_bytes[44],
            header_bytes[45],
            header_bytes[46],
        ]);
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(MatrixStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let mut row_count = [0u8; 8];
        row_count.copy_from_slice(&header_bytes[35..43]);

        Ok(Header {
            version,
            model_id,
            dimensions: u16::from_le_bytes([header_bytes[33], header_bytes[34]]),
            row_count: u64::from_le_bytes(row_count),
        })
    }

    fn validate_header(
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), MatrixStorageError> {
        if header.model_id != *expected_model_id {
            return Err(MatrixStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(MatrixStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    row_count: u64,
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.version;
        bytes[1..33].copy_from_slice(&self.model_id);
        bytes[33..35].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[35..43].copy_from_slice(&self.row_count.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[0..43]);
        bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }
}
