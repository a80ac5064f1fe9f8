//! `.nn1` weight files.
//!
//! A gzip stream holding, bincode-encoded and in this order: the format
//! version (`i32`), the cost the weights were saved at (`f32`), the number
//! of entries (`u64`), then one `(String, ArrayD<f32>)` pair per entry.
//! Entries cover the learnable parameters followed by the normalization
//! buffers of a [`Model`].

use crate::nn::Model;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::ArrayD;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const NN1_VERSION: i32 = 1;
pub const NN1_EXTENSION: &str = "nn1";

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(PathBuf),

    #[error("weight '{0}' not found in model")]
    NotFound(String),

    #[error("weight '{name}' has shape {stored:?}, model expects {expected:?}")]
    ShapeMismatch { name: String, stored: Vec<usize>, expected: Vec<usize> },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(i32),
}

type Result<T> = std::result::Result<T, SerializationError>;

fn check_extension(path: &Path) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(NN1_EXTENSION) => Ok(()),
        _ => Err(SerializationError::UnsupportedExtension(path.to_path_buf())),
    }
}

/// Writes `weights` with `cost` to `path`.
pub fn write_nn1(path: &Path, cost: f32, weights: &[(String, ArrayD<f32>)]) -> Result<()> {
    check_extension(path)?;
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = GzEncoder::new(file, Compression::default());
    bincode::serialize_into(&mut encoder, &NN1_VERSION)?;
    bincode::serialize_into(&mut encoder, &cost)?;
    bincode::serialize_into(&mut encoder, &(weights.len() as u64))?;
    for entry in weights {
        bincode::serialize_into(&mut encoder, entry)?;
    }
    encoder.finish()?.flush()?;
    Ok(())
}

/// Reads a file written by [`write_nn1`]: the stored cost and the entries.
pub fn read_nn1(path: &Path) -> Result<(f32, Vec<(String, ArrayD<f32>)>)> {
    check_extension(path)?;
    let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let version: i32 = bincode::deserialize_from(&mut decoder)?;
    if version != NN1_VERSION {
        return Err(SerializationError::UnsupportedVersion(version));
    }
    let cost: f32 = bincode::deserialize_from(&mut decoder)?;
    let count: u64 = bincode::deserialize_from(&mut decoder)?;
    let mut weights = Vec::new();
    for _ in 0..count {
        weights.push(bincode::deserialize_from(&mut decoder)?);
    }
    Ok((cost, weights))
}

impl Model {
    /// Saves every parameter and buffer value.
    pub fn save(&self, path: impl AsRef<Path>, cost: f32) -> Result<()> {
        let path = path.as_ref();
        let mut weights = self.parameter_values();
        weights.extend(self.buffer_names().into_iter().filter_map(|n| self.value(&n).map(|v| (n, v))));
        write_nn1(path, cost, &weights)?;
        info!(path = %path.display(), weights = weights.len(), cost, "saved weights");
        Ok(())
    }

    /// Loads weights saved by [`Model::save`] and returns the stored cost.
    ///
    /// Every entry must name a parameter or buffer of this model with the
    /// same shape. Nothing is changed unless all entries fit.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<f32> {
        let path = path.as_ref();
        let (cost, weights) = read_nn1(path)?;
        for (name, value) in &weights {
            let expected = self.value_shape(name).ok_or_else(|| SerializationError::NotFound(name.clone()))?;
            if expected != value.shape() {
                return Err(SerializationError::ShapeMismatch {
                    name: name.clone(),
                    stored: value.shape().to_vec(),
                    expected,
                });
            }
        }
        let count = weights.len();
        for (name, value) in weights {
            self.set_value(&name, value);
        }
        debug!(path = %path.display(), weights = count, cost, "loaded weights");
        Ok(cost)
    }
}
