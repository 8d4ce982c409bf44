//! Query results.
//!
//! A [`Response`] holds the result sets of one executed command — possibly
//! several statements, each with its own rows and column names. `Clone` is
//! a deep copy; cached responses are cloned out, never aliased.
//!
//! Cell values are the backend's text representation (`None` for NULL);
//! decoding beyond that is left to the caller, with [`ResultSet::parse`]
//! as a convenience.

use std::str::FromStr;
use tokio_postgres::SimpleQueryMessage;

/// One statement's rows and metadata.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    rows_affected: u64,
}

impl ResultSet {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    /// Number of rows returned.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows reported by the command tag (useful for DML without RETURNING).
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Cell text by row and column index; `None` for NULL or out of range.
    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Cell text by row index and column name.
    pub fn value(&self, row: usize, name: &str) -> Option<&str> {
        self.get(row, self.column_index(name)?)
    }

    /// Parse a cell through `FromStr`.
    pub fn parse<T: FromStr>(&self, row: usize, col: usize) -> Option<T> {
        self.get(row, col)?.parse().ok()
    }

    pub(crate) fn from_parts(
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
        rows_affected: u64,
    ) -> Self {
        Self {
            columns,
            rows,
            rows_affected,
        }
    }
}

/// The full result of one executed command.
#[derive(Debug, Clone, Default)]
pub struct Response {
    sets: Vec<ResultSet>,
}

impl Response {
    pub fn sets(&self) -> &[ResultSet] {
        &self.sets
    }

    /// Number of statement result sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn first(&self) -> Option<&ResultSet> {
        self.sets.first()
    }

    /// Cell text from the first result set.
    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.first()?.get(row, col)
    }

    pub(crate) fn from_sets(sets: Vec<ResultSet>) -> Self {
        Self { sets }
    }

    /// Assemble per-statement sets from a simple-query message stream.
    pub(crate) fn from_messages(messages: Vec<SimpleQueryMessage>) -> Self {
        let mut sets = Vec::new();
        let mut current: Option<ResultSet> = None;
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(columns) => {
                    current = Some(ResultSet::from_parts(
                        columns.iter().map(|c| c.name().to_string()).collect(),
                        Vec::new(),
                        0,
                    ));
                }
                SimpleQueryMessage::Row(row) => {
                    let set = current.get_or_insert_with(ResultSet::default);
                    if set.columns.is_empty() {
                        set.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    let mut cells = Vec::with_capacity(row.len());
                    for i in 0..row.len() {
                        cells.push(row.get(i).map(|v| v.to_string()));
                    }
                    set.rows.push(cells);
                }
                SimpleQueryMessage::CommandComplete(count) => {
                    let mut set = current.take().unwrap_or_default();
                    set.rows_affected = count;
                    sets.push(set);
                }
                _ => {}
            }
        }
        if let Some(set) = current.take() {
            sets.push(set);
        }
        Self { sets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Response {
        Response::from_sets(vec![
            ResultSet::from_parts(
                vec!["id".to_string(), "name".to_string()],
                vec![
                    vec![Some("1".to_string()), Some("ada".to_string())],
                    vec![Some("2".to_string()), None],
                ],
                2,
            ),
            ResultSet::from_parts(Vec::new(), Vec::new(), 7),
        ])
    }

    #[test]
    fn test_row_column_access() {
        let response = sample();
        assert_eq!(response.len(), 2);
        assert_eq!(response.get(0, 1), Some("ada"));
        assert_eq!(response.get(1, 1), None); // NULL
        assert_eq!(response.get(9, 0), None); // out of range
    }

    #[test]
    fn test_column_lookup_and_parse() {
        let response = sample();
        let set = response.first().expect("first set");
        assert_eq!(set.column_index("name"), Some(1));
        assert_eq!(set.value(0, "name"), Some("ada"));
        assert_eq!(set.parse::<i64>(1, 0), Some(2));
    }

    #[test]
    fn test_rows_affected() {
        let response = sample();
        assert_eq!(response.sets()[1].rows_affected(), 7);
        assert!(response.sets()[1].is_empty());
    }

    #[test]
    fn test_deep_copy() {
        let response = sample();
        let copy = response.clone();
        drop(response);
        assert_eq!(copy.get(0, 0), Some("1"));
    }
}
