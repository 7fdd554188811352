//! Corpus metadata: the rows an index's item ids point at.
//!
//! A [`Corpus`] is loaded once at startup from a CSV file and shared
//! read-only. Item ids must be the dense range `0..n` so that an id is also a
//! row position.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CorpusError, MetadataLookupError};
use crate::vector::{AnnIndex, ItemId};

/// One corpus row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorpusItem {
    pub id: ItemId,
    /// Snippet that was embedded and is shown with results
    pub text: String,
    pub title: String,
    pub url: String,
    pub paragraphs: Vec<String>,
}

impl CorpusItem {
    pub fn new(
        id: u32,
        text: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: ItemId::new(id),
            text: text.into(),
            title: title.into(),
            url: url.into(),
            paragraphs: Vec::new(),
        }
    }
}

/// Raw CSV row. Columns other than these are ignored.
#[derive(Debug, Deserialize)]
struct CsvRow {
    id: u32,
    intro: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    paragraphs: String,
}

/// An immutable, validated corpus.
#[derive(Debug, Clone)]
pub struct Corpus {
    name: String,
    items: Vec<CorpusItem>,
}

impl Corpus {
    /// Builds a corpus from rows in any order.
    pub fn new(name: impl Into<String>, mut items: Vec<CorpusItem>) -> Result<Self, CorpusError> {
        let name = name.into();
        if items.is_empty() {
            return Err(CorpusError::Empty { corpus: name });
        }

        items.sort_by_key(|item| item.id);
        for (expected, item) in items.iter().enumerate() {
            if item.id.as_index() != expected {
                return Err(CorpusError::NonDenseIds {
                    corpus: name,
                    expected: expected as u32,
                    found: item.id.get(),
                });
            }
        }

        Ok(Self { name, items })
    }

    /// Loads a corpus from a CSV file with an `id, intro, title, url,
    /// paragraphs` header. An unnamed first column is taken as `id`.
    pub fn from_csv(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let name = name.into();
        let path = path.as_ref();
        debug!("Loading corpus '{name}' from {}", path.display());

        let read_error = |source| CorpusError::Read {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(read_error)?;

        let headers = reader.headers().map_err(read_error)?.clone();
        if headers.get(0).is_some_and(|h| h.trim().is_empty()) {
            let renamed: csv::StringRecord = std::iter::once("id")
                .chain(headers.iter().skip(1))
                .collect();
            reader.set_headers(renamed);
        }

        let mut items = Vec::new();
        for (index, row) in reader.deserialize::<CsvRow>().enumerate() {
            let row = row.map_err(|source| CorpusError::Row {
                row: index as u64 + 1,
                source,
            })?;
            items.push(CorpusItem {
                id: ItemId::new(row.id),
                text: row.intro,
                title: row.title,
                url: row.url,
                paragraphs: parse_paragraphs(&row.paragraphs),
            });
        }

        let corpus = Self::new(name, items)?;
        info!("Loaded corpus '{}' with {} items", corpus.name, corpus.len());
        Ok(corpus)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[CorpusItem] {
        &self.items
    }

    /// Looks up a row by item id.
    pub fn get(&self, id: ItemId) -> Result<&CorpusItem, MetadataLookupError> {
        self.items
            .get(id.as_index())
            .ok_or_else(|| MetadataLookupError {
                corpus: self.name.clone(),
                id,
            })
    }

    /// Texts in id order, as embedded when building an index.
    pub fn texts(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.text.as_str()).collect()
    }

    /// Checks that an index was built from a corpus of this size.
    pub fn verify_len(&self, index_len: usize) -> Result<(), CorpusError> {
        if index_len != self.len() {
            return Err(CorpusError::SizeMismatch {
                corpus: self.name.clone(),
                index_len,
                corpus_len: self.len(),
            });
        }
        Ok(())
    }

    pub fn verify_index(&self, index: &AnnIndex) -> Result<(), CorpusError> {
        self.verify_len(index.len())
    }
}

/// Parses a list serialized as `['first', 'second']`.
fn parse_paragraphs(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(raw)
        .trim();
    let inner = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(inner);

    if inner.is_empty() {
        return Vec::new();
    }
    inner.split("', '").map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CSV: &str = "\
,intro,title,url,paragraphs,embeds
1,A talk about teams,Teams,https://example.com/teams,\"['Teams win.', 'Together.']\",\"[0.1]\"
0,A talk about focus,Focus,https://example.com/focus,['Deep work.'],\"[0.2]\"
";

    #[test]
    fn test_from_csv_with_unnamed_index_column() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corpus.csv");
        fs::write(&path, CSV).unwrap();

        let corpus = Corpus::from_csv("talks", &path).unwrap();
        assert_eq!(corpus.name(), "talks");
        assert_eq!(corpus.len(), 2);

        let focus = corpus.get(ItemId::new(0)).unwrap();
        assert_eq!(focus.title, "Focus");
        assert_eq!(focus.text, "A talk about focus");
        assert_eq!(focus.paragraphs, vec!["Deep work."]);

        let teams = corpus.get(ItemId::new(1)).unwrap();
        assert_eq!(teams.url, "https://example.com/teams");
        assert_eq!(teams.paragraphs, vec!["Teams win.", "Together."]);

        assert_eq!(corpus.texts(), vec!["A talk about focus", "A talk about teams"]);
    }

    #[test]
    fn test_missing_row_is_lookup_error() {
        let corpus = Corpus::new("talks", vec![CorpusItem::new(0, "a", "A", "u")]).unwrap();
        let err = corpus.get(ItemId::new(999)).unwrap_err();
        assert_eq!(err.id, ItemId::new(999));
        assert_eq!(err.corpus, "talks");
    }

    #[test]
    fn test_rejects_gaps_duplicates_and_empty() {
        let gap = vec![CorpusItem::new(0, "a", "A", "u"), CorpusItem::new(2, "c", "C", "u")];
        assert!(matches!(
            Corpus::new("c", gap),
            Err(CorpusError::NonDenseIds {
                expected: 1,
                found: 2,
                ..
            })
        ));

        let dup = vec![CorpusItem::new(0, "a", "A", "u"), CorpusItem::new(0, "b", "B", "u")];
        assert!(matches!(
            Corpus::new("c", dup),
            Err(CorpusError::NonDenseIds { .. })
        ));

        assert!(matches!(
            Corpus::new("c", Vec::new()),
            Err(CorpusError::Empty { .. })
        ));
    }

    #[test]
    fn test_malformed_row() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corpus.csv");
        fs::write(&path, "id,intro,title,url\nzero,text,title,url\n").unwrap();

        assert!(matches!(
            Corpus::from_csv("c", &path),
            Err(CorpusError::Row { row: 1, .. })
        ));
        assert!(matches!(
            Corpus::from_csv("c", temp_dir.path().join("missing.csv")),
            Err(CorpusError::Read { .. })
        ));
    }

    #[test]
    fn test_verify_len() {
        let corpus = Corpus::new("c", vec![CorpusItem::new(0, "a", "A", "u")]).unwrap();
        assert!(corpus.verify_len(1).is_ok());
        assert!(matches!(
            corpus.verify_len(3),
            Err(CorpusError::SizeMismatch {
                index_len: 3,
                corpus_len: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_paragraphs() {
        assert!(parse_paragraphs("[]").is_empty());
        assert!(parse_paragraphs("").is_empty());
        assert_eq!(parse_paragraphs("['one']"), vec!["one"]);
        assert_eq!(parse_paragraphs("['one', 'two']"), vec!["one", "two"]);
    }
}
