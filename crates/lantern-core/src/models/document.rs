use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Store-assigned primary key of a document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DocumentId(pub i64);

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub title: String,
    pub abstract_text: String,
    pub authors: Option<String>,
    pub year: Option<i32>,
}

/// Identifiers accumulated across every executed query, deduplicated before any full fetch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DocumentIdSet {
    ids: BTreeSet<DocumentId>,
}

impl DocumentIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many of `ids` were not already present.
    pub fn extend_from(&mut self, ids: impl IntoIterator<Item = DocumentId>) -> usize {
        let before = self.ids.len();
        self.ids.extend(ids);
        self.ids.len() - before
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = DocumentId> + '_ {
        self.ids.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<DocumentId> {
        self.iter().collect()
    }
}

impl FromIterator<DocumentId> for DocumentIdSet {
    fn from_iter<I: IntoIterator<Item = DocumentId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}
