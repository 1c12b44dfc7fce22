//! Cell key codec.
//!
//! Sessions store cells sparsely under `"row:col"` field names. Both parts
//! are non-negative integers; anything else is rejected outright rather
//! than clamped or guessed.

use thiserror::Error;

/// A `(row, col)` cell address. Row 0 is the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub row: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("invalid cell key {0:?}: expected format 'row:col'")]
    Format(String),
    #[error("invalid row index in {0:?}")]
    Row(String),
    #[error("invalid column index in {0:?}")]
    Column(String),
    #[error("negative indices in {0:?} are not allowed")]
    Negative(String),
    #[error("row index in {key:?} is past the {limit}-row limit")]
    RowLimit { key: String, limit: usize },
}

impl CellKey {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// Format as the `"row:col"` field name.
    pub fn encode(&self) -> String {
        encode(self.row, self.col)
    }
}

impl std::fmt::Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.row, self.col)
    }
}

impl std::str::FromStr for CellKey {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

pub fn encode(row: usize, col: usize) -> String {
    format!("{row}:{col}")
}

/// Parse a `"row:col"` field name.
///
/// Tokens are parsed as signed integers first so that `"-5:-10"` reports a
/// negative index instead of a generic parse failure.
pub fn decode(input: &str) -> Result<CellKey, CoordError> {
    let mut parts = input.split(':');
    let (row, col) = match (parts.next(), parts.next(), parts.next()) {
        (Some(row), Some(col), None) => (row, col),
        _ => return Err(CoordError::Format(input.to_string())),
    };

    let row: i64 = row
        .parse()
        .map_err(|_| CoordError::Row(input.to_string()))?;
    let col: i64 = col
        .parse()
        .map_err(|_| CoordError::Column(input.to_string()))?;

    if row < 0 || col < 0 {
        return Err(CoordError::Negative(input.to_string()));
    }

    let row = usize::try_from(row).map_err(|_| CoordError::Row(input.to_string()))?;
    let col = usize::try_from(col).map_err(|_| CoordError::Column(input.to_string()))?;
    Ok(CellKey { row, col })
}
