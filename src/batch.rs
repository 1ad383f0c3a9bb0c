//! Tabular serialization of a window's feature vectors.

use std::{fs, io, path::Path};

use chrono::Local;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::features::{FeatureVector, Schema};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to write feature table: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to create temporary feature file: {0}")]
    Io(#[from] io::Error),
}

/// One row per flow, columns fixed by the schema.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeatureBatch {
    pub schema: Schema,
    pub rows: Vec<FeatureVector>,
}

impl FeatureBatch {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn header(&self) -> Vec<&'static str> {
        self.schema.columns().into_iter().map(|f| f.name()).collect()
    }

    pub fn write_csv<W: io::Write>(&self, out: W) -> Result<(), BatchError> {
        let columns = self.schema.columns();
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(columns.iter().map(|f| f.name()))?;
        for row in &self.rows {
            writer.write_record(columns.iter().map(|&f| row.get(f).to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, BatchError> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(buf)
    }

    /// Writes the table into a fresh temporary file inside `dir`. The file is
    /// removed when the handle is dropped.
    pub fn to_temp_file(&self, dir: &Path) -> Result<NamedTempFile, BatchError> {
        let prefix = format!("features_{}_", Local::now().format("%Y%m%d_%H%M%S"));
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".csv")
            .tempfile_in(dir)?;
        self.write_csv(file.as_file_mut())?;
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<(), BatchError> {
        let file = fs::File::create(path)?;
        self.write_csv(io::BufWriter::new(file))
    }
}
