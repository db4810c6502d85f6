//! Query compile/enumerate seam.

use crate::error::StorageResult;

/// The language a query expression is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLanguage {
    /// The expression names a key-store; results are its live records.
    ///
    /// This is the only language the built-in engine implements.
    StoreScan,
    /// A JSON query tree, compiled by full query-capable engines.
    Json,
}

/// Options captured when an enumerator is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Maximum number of rows to return.
    pub limit: Option<u64>,
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    /// Record key.
    pub key: Vec<u8>,
    /// Record body.
    pub body: Vec<u8>,
    /// Record sequence.
    pub sequence: u64,
}

/// A compiled query, bound to the data-file handle that compiled it.
pub trait Query: Send + Sync {
    /// The source expression.
    fn expression(&self) -> &str;

    /// The expression's language.
    fn language(&self) -> QueryLanguage;

    /// Runs the query, producing an immutable result snapshot.
    fn create_enumerator(&self, options: &QueryOptions) -> StorageResult<QueryEnumerator>;
}

/// An immutable snapshot of query results.
///
/// Enumerators are shared between the live querier and its delegate, so they
/// are never mutated after creation; a re-run produces a new snapshot.
#[derive(Debug)]
pub struct QueryEnumerator {
    rows: Vec<QueryRow>,
    last_sequence: u64,
    options: QueryOptions,
}

impl QueryEnumerator {
    /// Creates a snapshot from rows and the tracked last sequence.
    #[must_use]
    pub fn new(rows: Vec<QueryRow>, last_sequence: u64, options: QueryOptions) -> Self {
        Self {
            rows,
            last_sequence,
            options,
        }
    }

    /// The result rows.
    #[must_use]
    pub fn rows(&self) -> &[QueryRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The last sequence of the referenced store(s) when this snapshot was
    /// taken.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// The options this snapshot was created with.
    #[must_use]
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Whether `newer` supersedes this snapshot.
    ///
    /// If the referenced sequences have not moved forward, the results are
    /// known to be identical and `newer` can be discarded.
    #[must_use]
    pub fn obsoleted_by(&self, newer: &QueryEnumerator) -> bool {
        newer.last_sequence > self.last_sequence
    }
}
