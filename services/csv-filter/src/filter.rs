//! Dimension filtering over CSV datasets.
//!
//! Input files follow the dataset layout (version 1):
//!
//! ```text
//! row 0   title row, copied as is
//! row 1   field definitions; from column 3 onwards every group of three
//!         columns is [hierarchy, dimension name, dimension value]
//! row 2.. observations
//! ```
//!
//! The dimension columns are located once from row 1 and reused for every
//! observation. A change to the start column or the group width is a new
//! layout version, not a tweak to this module.

use crate::model::DimensionFilters;
use csv::{ByteRecord, ReaderBuilder, Writer, WriterBuilder};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument};

/// Column of the first dimension group in the definition row
pub const DIMENSION_START_INDEX: usize = 3;

/// Width of a dimension group
pub const DIMENSION_STRIDE: usize = 3;

/// Offset of the dimension name within its group
const NAME_OFFSET: usize = 1;

/// Offset of the dimension value within its group
const VALUE_OFFSET: usize = 2;

const TITLE_ROW: u64 = 0;
const DEFINITION_ROW: u64 = 1;

/// Errors that abort processing of a file
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Malformed row {row}: {reason}")]
    MalformedRow { row: u64, reason: String },

    #[error("Dimension '{dimension}' is not present in the field definition row")]
    MissingDimensionColumn { dimension: String },

    #[error("Failed to read input: {0}")]
    Read(#[source] csv::Error),

    #[error("Failed to write output: {0}")]
    Write(#[source] csv::Error),

    #[error("Failed to flush output: {0}")]
    Flush(#[source] std::io::Error),
}

impl ProcessError {
    fn from_read(row: u64, err: csv::Error) -> Self {
        if err.is_io_error() {
            ProcessError::Read(err)
        } else {
            ProcessError::MalformedRow {
                row,
                reason: err.to_string(),
            }
        }
    }
}

/// Row counts for a processed file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub rows_read: u64,
    pub rows_written: u64,
}

/// Filters a CSV stream by dimension values
pub trait CsvProcessor: Send + Sync {
    /// Copy the rows of `input` matching `dimensions` to `output`.
    ///
    /// The output is flushed once the input is exhausted. Any read or parse
    /// failure aborts the whole file.
    fn process(
        &self,
        request_id: &str,
        input: &mut dyn Read,
        output: &mut dyn Write,
        dimensions: &DimensionFilters,
    ) -> Result<FilterSummary, ProcessError>;
}

/// Column index of each dimension's value, read from the definition row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionLocations {
    columns: HashMap<String, usize>,
}

impl DimensionLocations {
    /// Build the table from the field definition row
    pub fn from_definition_row(row: &ByteRecord) -> Result<Self, ProcessError> {
        let mut columns = HashMap::new();

        for group in (DIMENSION_START_INDEX..row.len()).step_by(DIMENSION_STRIDE) {
            let value_column = group + VALUE_OFFSET;
            if value_column >= row.len() {
                return Err(ProcessError::MalformedRow {
                    row: DEFINITION_ROW,
                    reason: format!(
                        "incomplete dimension group at column {} ({} columns)",
                        group,
                        row.len()
                    ),
                });
            }

            let name = String::from_utf8_lossy(&row[group + NAME_OFFSET]);
            columns.insert(name.trim().to_string(), value_column);
        }

        Ok(Self { columns })
    }

    /// Value column for a dimension
    pub fn column(&self, dimension: &str) -> Option<usize> {
        self.columns.get(dimension).copied()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Resolve every requested dimension to its column; an unknown
    /// dimension is an error rather than a silent mismatch
    fn resolve<'a>(
        &self,
        dimensions: &'a DimensionFilters,
    ) -> Result<Vec<(usize, &'a HashSet<String>)>, ProcessError> {
        dimensions
            .iter()
            .map(|(name, values)| {
                self.column(name)
                    .map(|column| (column, values))
                    .ok_or_else(|| ProcessError::MissingDimensionColumn {
                        dimension: name.clone(),
                    })
            })
            .collect()
    }
}

/// Row predicate: every dimension must hold one of its acceptable values
fn row_matches(
    row_number: u64,
    row: &ByteRecord,
    criteria: &[(usize, &HashSet<String>)],
) -> Result<bool, ProcessError> {
    for (column, accepted) in criteria {
        let value = row.get(*column).ok_or_else(|| ProcessError::MalformedRow {
            row: row_number,
            reason: format!("no value in column {} ({} columns)", column, row.len()),
        })?;

        // Filter values are UTF-8, so a cell that is not can never match
        let matched = std::str::from_utf8(value).is_ok_and(|value| accepted.contains(value));
        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

/// [`CsvProcessor`] for the version 1 dataset layout
#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionProcessor;

impl DimensionProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl CsvProcessor for DimensionProcessor {
    #[instrument(skip_all, fields(request_id = %request_id, dimensions = dimensions.len()))]
    fn process(
        &self,
        request_id: &str,
        input: &mut dyn Read,
        output: &mut dyn Write,
        dimensions: &DimensionFilters,
    ) -> Result<FilterSummary, ProcessError> {
        let start = Instant::now();

        let mut reader = ReaderBuilder::new().has_headers(false).from_reader(input);
        let mut writer = WriterBuilder::new().from_writer(output);

        let mut record = ByteRecord::new();
        let mut summary = FilterSummary::default();
        let mut criteria: Vec<(usize, &HashSet<String>)> = Vec::new();

        loop {
            let row_number = summary.rows_read;
            let more = reader
                .read_byte_record(&mut record)
                .map_err(|e| ProcessError::from_read(row_number, e))?;
            if !more {
                break;
            }
            summary.rows_read += 1;

            let keep = if row_number == TITLE_ROW || dimensions.is_empty() {
                true
            } else if row_number == DEFINITION_ROW {
                let locations = DimensionLocations::from_definition_row(&record)?;
                debug!(
                    request_id = %request_id,
                    dimension_columns = locations.len(),
                    "Located dimension columns"
                );
                criteria = locations.resolve(dimensions)?;
                false
            } else {
                row_matches(row_number, &record, &criteria)?
            };

            if keep {
                write_row(&mut writer, &record)?;
                summary.rows_written += 1;
            }
        }

        writer.flush().map_err(ProcessError::Flush)?;

        debug!(
            request_id = %request_id,
            rows_read = summary.rows_read,
            rows_written = summary.rows_written,
            duration_ms = start.elapsed().as_millis() as u64,
            "Finished processing csv file"
        );

        Ok(summary)
    }
}

fn write_row<W: Write>(writer: &mut Writer<W>, record: &ByteRecord) -> Result<(), ProcessError> {
    writer.write_byte_record(record).map_err(ProcessError::Write)
}
