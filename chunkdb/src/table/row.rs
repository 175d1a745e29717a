//! Rows: column name to typed value, carried as JSON.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::key::Value;

/// A single record keyed by column name.
///
/// The JSON form is a flat object, which is also the payload-store body:
/// `{"id": 7, "email": "alice@example.com"}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    /// Column values by column name.
    pub columns: BTreeMap<String, Value>,
}

impl Row {
    /// An empty row.
    pub fn new() -> Self {
        Row::default()
    }

    /// Set a column value, returning the previous one.
    pub fn set(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.columns.insert(column.into(), value)
    }

    /// Value for `column`, if the row carries one.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Serialize into the JSON body stored in the payload store.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a payload body back into a row.
    pub fn from_payload(bytes: &[u8]) -> Result<Row> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_round_trips_rows_through_json() {
        let mut row = Row::new();
        row.set("id", Value::Integer(7));
        row.set("email", Value::Text("alice@example.com".to_string()));
        row.set("score", Value::Float(0.75));

        let payload = row.to_payload().expect("serializes");
        let loaded = Row::from_payload(&payload).expect("deserializes");
        assert_eq!(row, loaded);
    }

    #[test]
    fn it_parses_typed_values_from_json() {
        let row = Row::from_payload(br#"{"id": 3, "score": 1.5, "name": "bob"}"#).expect("parses");
        assert_eq!(Some(&Value::Integer(3)), row.get("id"));
        assert_eq!(Some(&Value::Float(1.5)), row.get("score"));
        assert_eq!(Some(&Value::Text("bob".to_string())), row.get("name"));
        assert_eq!(None, row.get("missing"));
    }
}
