//! Column-oriented numeric frame over a polars `DataFrame`.
//!
//! Every column is `Float64` held in a single chunk. Missing cells are `NaN`
//! rather than null, so a column can always be borrowed as a plain `&[f64]`.
//! Column order is preserved and defines the feature order seen by the model.

use std::fs;
use std::io::{Cursor, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use polars::prelude::*;
use thiserror::Error;

use crate::series::{to_chunked, to_values};

/// Calendar index columns. These are never capped or scaled.
pub const CALENDAR_COLUMNS: [&str; 4] = ["year", "month", "day", "hour"];

/// Text columns decomposed into calendar fields when read from CSV.
const TIMESTAMP_COLUMNS: [&str; 2] = ["datetime", "timestamp"];

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column '{name}' has {actual} rows but the frame has {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("column '{0}' not found")]
    MissingColumn(String),
    #[error("failed to parse CSV {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: PolarsError,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no CSV files found at {0}")]
    NoData(String),
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

#[derive(Debug, Clone, Default)]
pub struct Frame {
    df: DataFrame,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from `(name, values)` pairs.
    pub fn from_columns<I, S>(columns: I) -> Result<Self, FrameError>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut frame = Self::new();
        for (name, values) in columns {
            frame.insert(name, values)?;
        }
        Ok(frame)
    }

    /// Adopt any polars frame: every column is cast to `Float64` and nulls become `NaN`.
    pub fn from_dataframe(df: &DataFrame) -> Result<Self, FrameError> {
        let mut frame = Self::new();
        for column in df.get_columns() {
            let numeric = column.cast(&DataType::Float64)?;
            frame.insert(column.name(), to_values(numeric.f64()?))?;
        }
        Ok(frame)
    }

    pub fn as_dataframe(&self) -> &DataFrame {
        &self.df
    }

    pub fn len(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    pub fn width(&self) -> usize {
        self.df.width()
    }

    /// Column names in frame order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.df.get_columns().iter().map(|s| s.name())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.names().map(str::to_string).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.df.get_column_index(name).is_some()
    }

    /// True when every named column exists.
    pub fn has_all(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.contains(n))
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.df.column(name).ok()?.f64().ok()?.cont_slice().ok()
    }

    pub fn require(&self, name: &str) -> Result<&[f64], FrameError> {
        self.column(name)
            .ok_or_else(|| FrameError::MissingColumn(name.to_string()))
    }

    fn columns(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.df
            .get_columns()
            .iter()
            .filter_map(|s| s.f64().ok()?.cont_slice().ok())
    }

    /// Insert or replace a column. Replacing keeps the column's position.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<(), FrameError> {
        let name = name.into();
        if self.width() > 0 && values.len() != self.len() {
            return Err(FrameError::LengthMismatch {
                name,
                expected: self.len(),
                actual: values.len(),
            });
        }
        let series = Series::new(&name, values);
        if self.width() == 0 {
            self.df = DataFrame::new(vec![series])?;
        } else {
            self.df.with_column(series)?;
        }
        Ok(())
    }

    /// Insert a column computed by the frame itself, where length is guaranteed.
    pub(crate) fn set(&mut self, name: impl Into<String>, values: Vec<f64>) {
        debug_assert!(self.width() == 0 || values.len() == self.len());
        if let Err(e) = self.insert(name, values) {
            tracing::error!(error = %e, "Failed to store derived column");
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<f64>> {
        let series = self.df.drop_in_place(name).ok()?;
        series.f64().ok().map(to_values)
    }

    /// Apply `f` to every value of one column in place.
    pub fn map_column<F>(&mut self, name: &str, f: F) -> Result<(), FrameError>
    where
        F: Fn(f64) -> f64,
    {
        let values = self.require(name)?.iter().map(|&v| f(v)).collect();
        self.insert(name, values)
    }

    /// Contiguous row slice.
    pub fn slice(&self, range: Range<usize>) -> Frame {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Frame {
            df: self.df.slice(start as i64, end - start),
        }
    }

    /// Rows in the given order.
    pub fn take(&self, rows: &[usize]) -> Result<Frame, FrameError> {
        let indices = IdxCa::from_vec("", rows.iter().map(|&r| r as IdxSize).collect());
        Ok(Frame {
            df: self.df.take(&indices)?,
        })
    }

    /// Subset of columns in the given order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Frame, FrameError> {
        if let Some(missing) = names.iter().find(|n| !self.contains(n.as_ref())) {
            return Err(FrameError::MissingColumn(missing.as_ref().to_string()));
        }
        let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
        Ok(Frame {
            df: self.df.select(names)?,
        })
    }

    /// Values of row `row` across all columns.
    pub fn row(&self, row: usize) -> Vec<f64> {
        self.columns().map(|c| c[row]).collect()
    }

    /// Timestamp of every row assembled from the calendar columns.
    pub fn timestamps(&self) -> Vec<Option<NaiveDateTime>> {
        let (Some(y), Some(m), Some(d), Some(h)) = (
            self.column("year"),
            self.column("month"),
            self.column("day"),
            self.column("hour"),
        ) else {
            return vec![None; self.len()];
        };
        (0..self.len())
            .map(|i| calendar_to_datetime(y[i], m[i], d[i], h[i]))
            .collect()
    }

    /// Stable chronological ordering.
    ///
    /// Rows without a valid timestamp are dropped. A frame without calendar
    /// columns has no time axis and is returned as is.
    pub fn sort_chronologically(&self) -> Result<Frame, FrameError> {
        if !self.has_all(&CALENDAR_COLUMNS) {
            return Ok(self.clone());
        }
        let mut order: Vec<(NaiveDateTime, usize)> = self
            .timestamps()
            .into_iter()
            .enumerate()
            .filter_map(|(i, stamp)| stamp.map(|s| (s, i)))
            .collect();
        let dropped = self.len() - order.len();
        if dropped > 0 {
            tracing::warn!(dropped, rows = self.len(), "Dropping rows without a valid timestamp");
        }
        order.sort_by_key(|&(stamp, _)| stamp);
        let rows: Vec<usize> = order.into_iter().map(|(_, i)| i).collect();
        self.take(&rows)
    }

    /// Append the rows of `other`. Columns missing on either side are NaN-filled.
    pub fn append(&mut self, other: &Frame) -> Result<(), FrameError> {
        if self.width() == 0 {
            *self = other.clone();
            return Ok(());
        }
        let mut other = other.clone();
        for name in other.column_names() {
            if !self.contains(&name) {
                self.set(name, vec![f64::NAN; self.len()]);
            }
        }
        for name in self.column_names() {
            if !other.contains(&name) {
                other.set(name, vec![f64::NAN; other.len()]);
            }
        }
        let aligned = other.select(&self.column_names())?;
        self.df.vstack_mut(&aligned.df)?;
        self.df.as_single_chunk();
        Ok(())
    }

    /// Vertical concatenation of frames.
    pub fn concat(frames: &[Frame]) -> Result<Frame, FrameError> {
        let mut out = Frame::new();
        for f in frames {
            out.append(f)?;
        }
        Ok(out)
    }

    /// Same column names in the same order with bit-identical values.
    pub fn same_values(&self, other: &Frame) -> bool {
        self.names().eq(other.names())
            && self.len() == other.len()
            && self.columns().zip(other.columns()).all(|(a, b)| {
                a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            })
    }

    /// Count of NaN or infinite cells.
    pub fn non_finite_count(&self) -> usize {
        self.columns()
            .map(|c| c.iter().filter(|v| !v.is_finite()).count())
            .sum()
    }

    /// Read a CSV file with a header row.
    pub fn read_csv(path: &Path) -> Result<Frame, FrameError> {
        let bytes = fs::read(path).map_err(|source| FrameError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_csv(bytes).map_err(|source| FrameError::Csv {
            path: path.display().to_string(),
            source,
        })
    }

    /// Parse CSV data. Unparseable numeric cells become NaN; columns without a
    /// single numeric cell are dropped, except timestamp text which is decomposed
    /// into calendar columns.
    pub fn from_csv_reader<R: Read>(mut reader: R) -> Result<Frame, FrameError> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|source| FrameError::Io {
                path: "<reader>".to_string(),
                source,
            })?;
        Ok(Self::parse_csv(bytes)?)
    }

    fn parse_csv(bytes: Vec<u8>) -> PolarsResult<Frame> {
        let options = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(None);
        let df = options
            .into_reader_with_file_handle(Cursor::new(bytes))
            .finish()?;

        let mut frame = Frame::new();
        let mut stamps: Option<Vec<Option<NaiveDateTime>>> = None;
        for column in df.get_columns() {
            let name = column.name();
            if TIMESTAMP_COLUMNS.contains(&name.to_lowercase().as_str()) {
                let text = column.cast(&DataType::String)?;
                stamps = Some(
                    text.str()?
                        .into_iter()
                        .map(|t| t.and_then(|t| parse_timestamp(t.trim())))
                        .collect(),
                );
                continue;
            }
            let non_empty = column.len() - column.null_count();
            let numeric = column.cast(&DataType::Float64)?;
            let parsed = numeric.len() - numeric.null_count();
            if parsed == 0 && non_empty > 0 {
                tracing::debug!(column = %name, "Dropping non-numeric column");
                continue;
            }
            if parsed < non_empty {
                tracing::debug!(
                    column = %name,
                    invalid = non_empty - parsed,
                    "Non-numeric cells replaced with NaN"
                );
            }
            frame.set(name, to_values(numeric.f64()?));
        }

        if let Some(stamps) = stamps {
            if !frame.has_all(&CALENDAR_COLUMNS) {
                frame.insert_calendar(&stamps);
            }
        }
        Ok(frame)
    }

    fn insert_calendar(&mut self, stamps: &[Option<NaiveDateTime>]) {
        let pick = |f: &dyn Fn(&NaiveDateTime) -> f64| -> Vec<f64> {
            stamps.iter().map(|s| s.as_ref().map_or(f64::NAN, f)).collect()
        };
        self.set("year", pick(&|s| f64::from(s.year())));
        self.set("month", pick(&|s| f64::from(s.month())));
        self.set("day", pick(&|s| f64::from(s.day())));
        self.set("hour", pick(&|s| f64::from(s.hour())));
    }

    /// Write the frame as CSV with a header row; NaN cells are written empty.
    pub fn write_csv(&self, path: &Path) -> Result<(), FrameError> {
        let columns: Vec<Series> = self
            .names()
            .zip(self.columns())
            .map(|(name, values)| to_chunked(values).with_name(name).into_series())
            .collect();
        let mut out = DataFrame::new(columns)?;
        let mut file = fs::File::create(path).map_err(|source| FrameError::Io {
            path: path.display().to_string(),
            source,
        })?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .finish(&mut out)
            .map_err(|source| FrameError::Csv {
                path: path.display().to_string(),
                source,
            })
    }
}

/// Load one CSV file or every `*.csv` file of a directory (one frame per site),
/// each sorted chronologically.
pub fn load_sites(path: &Path) -> Result<Vec<(String, Frame)>, FrameError> {
    let files: Vec<PathBuf> = if path.is_dir() {
        let entries = fs::read_dir(path).map_err(|source| FrameError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    if files.is_empty() {
        return Err(FrameError::NoData(path.display().to_string()));
    }

    let mut sites = Vec::with_capacity(files.len());
    for file in files {
        let frame = Frame::read_csv(&file)?.sort_chronologically()?;
        let name = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::info!(site = %name, rows = frame.len(), columns = frame.width(), "Loaded site data");
        sites.push((name, frame));
    }
    Ok(sites)
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Combine float calendar fields into a timestamp when they form a valid date.
pub fn calendar_to_datetime(year: f64, month: f64, day: f64, hour: f64) -> Option<NaiveDateTime> {
    if !(year.is_finite() && month.is_finite() && day.is_finite() && hour.is_finite()) {
        return None;
    }
    if month < 1.0 || day < 1.0 || hour < 0.0 {
        return None;
    }
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(hour as u32, 0, 0))
}
