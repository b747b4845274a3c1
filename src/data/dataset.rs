//! Scan results on disk and in memory.
//!
//! A run folder holds:
//! - `data.csv`: an `id` column plus one column per recorded step or parameter
//! - `<column>/<id>.txt` or `<column>/<id>.bin`: non-scalar values, whose
//!   table cell only repeats the row id
//! - `config.conf`: the scan configuration that produced the data
//!
//! Rows are written whole: side files first, then the table line, then the
//! in-memory copy. A row that fails half-way never reaches the table.
//!
//! [`Dataset::save`] copies a run to another place: the table to the chosen
//! file, side files next to it in a folder named after the file, and the
//! configuration to the same name with a `.conf` extension.

use crate::element::{Table, Value, ValueType};
use crate::error::{AppResult, LabError};
use indexmap::IndexMap;
use ndarray::ArrayD;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the table file in a run folder.
pub const DATA_FILE: &str = "data.csv";
/// Name of the configuration copy in a run folder.
pub const CONFIG_FILE: &str = "config.conf";

/// A named, typed column of the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name, the step or parameter name
    pub name: String,
    /// Type of the recorded values
    pub value_type: ValueType,
}

impl Column {
    /// Column `name` holding `value_type` values.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// One recorded row; `values` is aligned with the dataset columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Row id: 0 for the init recipe, then one per point
    pub id: u64,
    /// One cell per dataset column
    pub values: Vec<Option<Value>>,
}

/// Append-only record of one scan.
pub struct Dataset {
    folder: PathBuf,
    columns: Vec<Column>,
    rows: Vec<Row>,
    writer: csv::Writer<File>,
}

impl Dataset {
    /// Creates `folder` and the table file, whose header is fixed from now on.
    pub fn create(folder: impl Into<PathBuf>, columns: Vec<Column>) -> AppResult<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder)?;

        let mut writer = csv::Writer::from_path(folder.join(DATA_FILE))?;
        writer.write_record(
            std::iter::once("id").chain(columns.iter().map(|c| c.name.as_str())),
        )?;
        writer.flush()?;

        Ok(Self {
            folder,
            columns,
            rows: Vec::new(),
            writer,
        })
    }

    /// Run folder holding the table and the side files.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Columns after `id`, in table order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Recorded rows, in order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of recorded rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no row was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ids of the recorded rows.
    pub fn ids(&self) -> Vec<u64> {
        self.rows.iter().map(|row| row.id).collect()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Value of `column` in row `id`.
    pub fn value(&self, column: &str, id: u64) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows
            .iter()
            .find(|row| row.id == id)
            .and_then(|row| row.values[index].as_ref())
    }

    /// `(id, value)` of every row for `column`.
    pub fn column(&self, column: &str) -> Option<Vec<(u64, Option<Value>)>> {
        let index = self.column_index(column)?;
        Some(
            self.rows
                .iter()
                .map(|row| (row.id, row.values[index].clone()))
                .collect(),
        )
    }

    /// Path of the side file holding a non-scalar value.
    pub fn side_file(&self, column: &str, id: u64) -> Option<PathBuf> {
        let index = self.column_index(column)?;
        let extension = side_file_extension(self.columns[index].value_type)?;
        Some(self.folder.join(column).join(format!("{id}.{extension}")))
    }

    /// Appends a row. Columns absent from `values` are left empty.
    pub fn record(&mut self, id: u64, mut values: IndexMap<String, Value>) -> AppResult<()> {
        if let Some(unknown) = values.keys().find(|name| self.column_index(name).is_none()) {
            return Err(LabError::Recipe(format!(
                "dataset has no column '{unknown}'"
            )));
        }

        let mut row = Vec::with_capacity(self.columns.len());
        let mut cells = Vec::with_capacity(self.columns.len() + 1);
        cells.push(id.to_string());

        for column in &self.columns {
            let value = values.shift_remove(&column.name);
            let cell = match &value {
                None => String::new(),
                Some(value) if value.value_type().is_scalar() => value.to_string(),
                Some(value) => {
                    let path = self.folder.join(&column.name);
                    fs::create_dir_all(&path)?;
                    write_side_file(&path, id, value)?;
                    id.to_string()
                }
            };
            cells.push(cell);
            row.push(value);
        }

        self.writer.write_record(&cells)?;
        self.writer.flush()?;
        debug!(folder = %self.folder.display(), id, "row recorded");

        self.rows.push(Row { id, values: row });
        Ok(())
    }
}

impl Dataset {
    /// Copies the run to `path` (the table file), returning the files written.
    ///
    /// Side files of `<column>` go to `<path without extension>/<column>/`,
    /// the configuration copy, when the run has one, to `<path>.conf`.
    pub fn save(&self, path: impl AsRef<Path>) -> AppResult<Vec<PathBuf>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut written = Vec::new();

        fs::copy(self.folder.join(DATA_FILE), path)?;
        written.push(path.to_path_buf());

        let base = path.with_extension("");
        for column in &self.columns {
            let source = self.folder.join(&column.name);
            if side_file_extension(column.value_type).is_none() || !source.is_dir() {
                continue;
            }
            let target = base.join(&column.name);
            fs::create_dir_all(&target)?;
            for entry in fs::read_dir(&source)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    let destination = target.join(entry.file_name());
                    fs::copy(entry.path(), &destination)?;
                    written.push(destination);
                }
            }
        }

        let config = self.folder.join(CONFIG_FILE);
        if config.is_file() {
            let destination = path.with_extension("conf");
            fs::copy(config, &destination)?;
            written.push(destination);
        }

        info!(
            folder = %self.folder.display(),
            path = %path.display(),
            files = written.len(),
            "dataset saved"
        );
        Ok(written)
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("folder", &self.folder)
            .field("columns", &self.columns)
            .field("rows", &self.rows.len())
            .finish()
    }
}

fn side_file_extension(value_type: ValueType) -> Option<&'static str> {
    match value_type {
        ValueType::Array | ValueType::Table => Some("txt"),
        ValueType::Bytes => Some("bin"),
        _ => None,
    }
}

fn write_side_file(folder: &Path, id: u64, value: &Value) -> AppResult<()> {
    match value {
        Value::Bytes(bytes) => fs::write(folder.join(format!("{id}.bin")), bytes)?,
        Value::Array(array) => write_array(&folder.join(format!("{id}.txt")), array)?,
        Value::Table(table) => write_table(&folder.join(format!("{id}.txt")), table)?,
        scalar => {
            return Err(LabError::Recipe(format!(
                "{} values are stored in the table",
                scalar.value_type()
            )))
        }
    }
    Ok(())
}

/// One value per line for 1-D arrays, one row per line otherwise (trailing
/// axes flattened).
fn write_array(path: &Path, array: &ArrayD<f64>) -> AppResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let row_len = if array.ndim() <= 1 {
        1
    } else {
        array.shape()[1..].iter().product::<usize>().max(1)
    };
    let flat: Vec<f64> = array.iter().copied().collect();
    for chunk in flat.chunks(row_len) {
        writer.write_record(chunk.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

fn write_table(path: &Path, table: &Table) -> AppResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&table.columns)?;
    for row in table.data.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

// =============================================================================
// DatasetStore
// =============================================================================

/// Datasets recorded with the current scan configuration.
///
/// Cleared whenever the configuration changes, since the recipe defines the
/// dataset columns.
#[derive(Debug, Default)]
pub struct DatasetStore {
    datasets: RwLock<Vec<Arc<RwLock<Dataset>>>>,
}

impl DatasetStore {
    /// Empty, shareable store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends the dataset of a new run.
    pub fn push(&self, dataset: Arc<RwLock<Dataset>>) {
        self.datasets.write().push(dataset);
    }

    /// Most recent dataset.
    pub fn last(&self) -> Option<Arc<RwLock<Dataset>>> {
        self.datasets.read().last().cloned()
    }

    /// Every dataset, oldest first.
    pub fn all(&self) -> Vec<Arc<RwLock<Dataset>>> {
        self.datasets.read().clone()
    }

    /// Number of datasets held.
    pub fn len(&self) -> usize {
        self.datasets.read().len()
    }

    /// Whether the store holds no dataset.
    pub fn is_empty(&self) -> bool {
        self.datasets.read().is_empty()
    }

    /// Drops every dataset.
    pub fn clear(&self) {
        self.datasets.write().clear();
    }
}
