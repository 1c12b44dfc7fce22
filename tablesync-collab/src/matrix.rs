//! Dense ⇄ sparse sheet conversion.
//!
//! A session keeps cells as a flat `"row:col" → value` map. Joining clients
//! get a dense row-major snapshot rebuilt from that map with a fixed width.

use std::collections::HashMap;

use crate::coords::{self, CoordError};

/// Row-major sheet contents. Row 0 carries the column headers.
pub type Matrix = Vec<Vec<String>>;

/// Default cap on rows in a sheet, header included.
pub const MAX_ROWS: usize = 10_000;

/// Rebuild a dense matrix from sparse cells, with at most [`MAX_ROWS`] rows.
///
/// The result has `max(row) + 1` rows (counting only cells that were kept)
/// and exactly `column_count` columns. Cells at or beyond `column_count` are
/// dropped. Missing cells are empty strings. One malformed key fails the
/// whole reconstruction.
pub fn build<K, V, S>(cells: &HashMap<K, V, S>, column_count: usize) -> Result<Matrix, CoordError>
where
    K: AsRef<str>,
    V: AsRef<str>,
    S: std::hash::BuildHasher,
{
    build_with_limit(cells, column_count, MAX_ROWS)
}

/// [`build`] with an explicit row cap. A key at row `max_rows` or beyond
/// fails with [`CoordError::RowLimit`] before anything is allocated for it.
pub fn build_with_limit<K, V, S>(
    cells: &HashMap<K, V, S>,
    column_count: usize,
    max_rows: usize,
) -> Result<Matrix, CoordError>
where
    K: AsRef<str>,
    V: AsRef<str>,
    S: std::hash::BuildHasher,
{
    let mut matrix: Matrix = Vec::new();

    for (key, value) in cells {
        let cell = coords::decode(key.as_ref())?;
        if cell.row >= max_rows {
            return Err(CoordError::RowLimit {
                key: key.as_ref().to_string(),
                limit: max_rows,
            });
        }
        if cell.col >= column_count {
            continue;
        }
        if cell.row >= matrix.len() {
            matrix.resize_with(cell.row + 1, || vec![String::new(); column_count]);
        }
        matrix[cell.row][cell.col] = value.as_ref().to_string();
    }

    Ok(matrix)
}

/// Flatten a dense matrix into `("row:col", value)` pairs, row-major.
pub fn flatten(matrix: &[Vec<String>]) -> Vec<(String, String)> {
    matrix
        .iter()
        .enumerate()
        .flat_map(|(row, cells)| {
            cells
                .iter()
                .enumerate()
                .map(move |(col, value)| (coords::encode(row, col), value.clone()))
        })
        .collect()
}
