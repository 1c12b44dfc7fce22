//! Durable sheet records the server consults before admitting a session.
//!
//! The collaborative session only ever holds cell values. Everything else
//! about a sheet (its header, its deadline, whether it exists at all) comes
//! from a [`DocumentRepository`].

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::matrix::Matrix;

/// A sheet as stored durably: header row first, then data rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRecord {
    pub id: String,
    pub title: String,
    pub data: Matrix,
    /// Edits are refused once this moment has passed.
    pub deadline: SystemTime,
}

impl SheetRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>, data: Matrix, deadline: SystemTime) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            data,
            deadline,
        }
    }

    /// Header width. Zero for a sheet with no rows.
    pub fn column_count(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    pub fn deadline_passed(&self, now: SystemTime) -> bool {
        now > self.deadline
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("sheet {0} not found")]
    NotFound(String),
    #[error("repository error: {0}")]
    Backend(String),
}

/// Lookup of durable sheet records by id.
pub trait DocumentRepository: Send + Sync + 'static {
    fn get_sheet(&self, sheet_id: &str) -> impl Future<Output = Result<SheetRecord, RepositoryError>> + Send;
}

/// On-disk fixture shape: deadline as unix seconds.
#[derive(Debug, Serialize, Deserialize)]
struct SheetFixture {
    id: String,
    #[serde(default)]
    title: String,
    data: Matrix,
    deadline: u64,
}

impl From<SheetFixture> for SheetRecord {
    fn from(f: SheetFixture) -> Self {
        SheetRecord::new(f.id, f.title, f.data, UNIX_EPOCH + Duration::from_secs(f.deadline))
    }
}

/// Sheet records held in process memory. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    sheets: Arc<RwLock<HashMap<String, SheetRecord>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON array of `{"id", "title", "data", "deadline"}` objects.
    pub fn from_json(json: &str) -> Result<Self, RepositoryError> {
        let fixtures: Vec<SheetFixture> =
            serde_json::from_str(json).map_err(|e| RepositoryError::Backend(e.to_string()))?;
        let sheets = fixtures
            .into_iter()
            .map(|f| (f.id.clone(), SheetRecord::from(f)))
            .collect();
        Ok(Self {
            sheets: Arc::new(RwLock::new(sheets)),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| RepositoryError::Backend(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Add or replace a record.
    pub async fn insert(&self, sheet: SheetRecord) {
        self.sheets.write().await.insert(sheet.id.clone(), sheet);
    }

    pub async fn len(&self) -> usize {
        self.sheets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sheets.read().await.is_empty()
    }
}

impl DocumentRepository for InMemoryRepository {
    async fn get_sheet(&self, sheet_id: &str) -> Result<SheetRecord, RepositoryError> {
        self.sheets
            .read()
            .await
            .get(sheet_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(sheet_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(id: &str) -> SheetRecord {
        SheetRecord::new(
            id,
            "Roster",
            vec![
                vec!["Name".into(), "Email".into(), "Team".into()],
                vec!["ada".into(), "ada@example.com".into(), "".into()],
            ],
            SystemTime::now() + Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_column_count_is_header_width() {
        assert_eq!(sheet("s").column_count(), 3);
        let empty = SheetRecord::new("e", "", Vec::new(), SystemTime::now());
        assert_eq!(empty.column_count(), 0);
    }

    #[test]
    fn test_deadline_passed() {
        let record = sheet("s");
        assert!(!record.deadline_passed(SystemTime::now()));
        assert!(record.deadline_passed(record.deadline + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_get_sheet_and_not_found() {
        let repo = InMemoryRepository::new();
        repo.insert(sheet("abc")).await;

        assert_eq!(repo.get_sheet("abc").await.unwrap().title, "Roster");
        assert_eq!(
            repo.get_sheet("nope").await,
            Err(RepositoryError::NotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_from_json() {
        let repo = InMemoryRepository::from_json(
            r#"[{"id":"s1","title":"Signups","data":[["Name"],["ada"]],"deadline":4102444800}]"#,
        )
        .unwrap();
        assert_eq!(repo.len().await, 1);

        let record = repo.get_sheet("s1").await.unwrap();
        assert_eq!(record.data, vec![vec!["Name".to_string()], vec!["ada".to_string()]]);
        assert_eq!(record.deadline, UNIX_EPOCH + Duration::from_secs(4_102_444_800));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            InMemoryRepository::from_json(r#"{"id":"s1"}"#),
            Err(RepositoryError::Backend(_))
        ));
    }
}
