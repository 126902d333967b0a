//! The spreadsheet side of the pipeline: cell values, declarative
//! formatting plans, and the `Sink` capability reports are written through.

use std::fmt;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use thiserror::Error;

pub mod csv_dir;
pub mod memory;
pub mod sheets;

pub use csv_dir::CsvDirSink;
pub use memory::MemorySink;
pub use sheets::SheetsSink;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Blank,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn number(value: Option<f64>) -> Self {
        value.map_or(Cell::Blank, Cell::Number)
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Cell::Blank)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Blank => Ok(()),
            Cell::Text(text) => f.write_str(text),
            Cell::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                write!(f, "{}", *value as i64)
            }
            Cell::Number(value) => write!(f, "{value}"),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Blank => serializer.serialize_str(""),
            Cell::Text(text) => serializer.serialize_str(text),
            Cell::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                serializer.serialize_i64(*value as i64)
            }
            Cell::Number(value) => serializer.serialize_f64(*value),
        }
    }
}

/// Zero-based cell address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    pub const ORIGIN: CellRef = CellRef { row: 0, col: 0 };
}

/// Zero-based, end-exclusive block of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRange {
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
}

impl GridRange {
    pub fn new(rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Self {
        Self {
            start_row: rows.start,
            end_row: rows.end,
            start_col: cols.start,
            end_col: cols.end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_row >= self.end_row || self.start_col >= self.end_col
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

impl Color {
    pub const fn rgb(red: f32, green: f32, blue: f32) -> Self {
        Self { red, green, blue }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellStyle {
    pub background: Option<Color>,
    pub bold: bool,
    pub foreground: Option<Color>,
    pub centered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormatRule {
    BasicFilter {
        range: GridRange,
    },
    Style {
        range: GridRange,
        style: CellStyle,
    },
    ColumnWidth {
        col: usize,
        pixels: u32,
    },
    Banding {
        range: GridRange,
        first: Color,
        second: Color,
    },
    NumberFormat {
        range: GridRange,
        pattern: String,
    },
    /// Highlight cells whose numeric value is strictly below `threshold`.
    BelowThreshold {
        ranges: Vec<GridRange>,
        threshold: f64,
        fill: Color,
    },
    /// Highlight cells that hold no value.
    Blank {
        ranges: Vec<GridRange>,
        fill: Color,
    },
    Borders {
        range: GridRange,
    },
    FreezeRows {
        count: usize,
    },
}

/// Ordered formatting requests, handed to the sink in one piece.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FormattingPlan {
    rules: Vec<FormatRule>,
}

impl FormattingPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: FormatRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[FormatRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceHandle {
    pub sheet_id: String,
    pub surface_id: i64,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("sink authentication failed: {0}")]
    Auth(String),
    #[error("surface not found: {0}")]
    SurfaceNotFound(String),
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("unexpected sink response: {0}")]
    Malformed(String),
}

/// A persistent tabular store with named surfaces (tabs).
///
/// Implementations are shared read-only by concurrent exports.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn list_surfaces(&self, sheet_id: &str) -> Result<Vec<String>, SinkError>;

    async fn delete_surface(&self, sheet_id: &str, name: &str) -> Result<(), SinkError>;

    async fn create_surface(
        &self,
        sheet_id: &str,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<SurfaceHandle, SinkError>;

    async fn write_range(
        &self,
        surface: &SurfaceHandle,
        top_left: CellRef,
        grid: &[Vec<Cell>],
    ) -> Result<(), SinkError>;

    async fn apply_formatting(
        &self,
        surface: &SurfaceHandle,
        plan: &FormattingPlan,
    ) -> Result<(), SinkError>;

    async fn reorder_surfaces(&self, sheet_id: &str, ordered_names: &[String])
        -> Result<(), SinkError>;
}
