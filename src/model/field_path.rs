use std::cmp::Ordering;

use crate::error::{invalid_argument, SyncResult};

const KEY_FIELD_NAME: &str = "__name__";

/// Dot-separated path into a document's field map.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> SyncResult<Self> {
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(invalid_argument("Field paths must not contain empty segments"));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> SyncResult<Self> {
        Self::new(path.split('.').map(str::to_string).collect())
    }

    /// The reserved path that orders documents by key. Appended implicitly
    /// to every query ordering as the final tiebreak.
    pub fn key_path() -> Self {
        Self {
            segments: vec![KEY_FIELD_NAME.to_string()],
        }
    }

    pub fn is_key_path(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == KEY_FIELD_NAME
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.segments.iter().zip(other.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_path() {
        let path = FieldPath::from_dot_separated("tariff.peak.rate").unwrap();
        assert_eq!(path.segments().len(), 3);
        assert_eq!(path.canonical_string(), "tariff.peak.rate");
    }

    #[test]
    fn key_path_is_reserved() {
        assert!(FieldPath::key_path().is_key_path());
        assert!(!FieldPath::from_dot_separated("name").unwrap().is_key_path());
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(FieldPath::from_dot_separated("a..b").is_err());
    }
}
