//! 🧮 The Row Projector: squashes a `Record` into a flat `Row`.
//!
//! Two moods. Explicit: "these columns, this order, no questions". Implicit:
//! "whatever the record brought, in the order it brought it". Either way every
//! cell comes out as text, and anything too nested to be a cell is refused at
//! the door with a `ProjectionError`.

use std::sync::Arc;

use crate::common::{Record, Row, Value};
use crate::errors::ProjectionError;

/// 🧮 Stateless record → row flattener. Cheap to clone, share freely.
#[derive(Debug, Clone, Default)]
pub struct RowProjector {
    columns: Option<Arc<[String]>>,
}

impl RowProjector {
    pub fn new(columns: Option<Arc<[String]>>) -> Self {
        Self { columns }
    }

    pub fn project(&self, record: &Record) -> Result<Row, ProjectionError> {
        match &self.columns {
            Some(columns) => {
                let mut row = Row::with_capacity(columns.len());
                for column in columns.iter() {
                    // 🕳️ absent column is an empty cell, not an error
                    let text = match record.get(column) {
                        Some(value) => cell_text(column, value)?,
                        None => String::new(),
                    };
                    row.push(column.as_str(), text);
                }
                Ok(row)
            }
            None => {
                let mut row = Row::with_capacity(record.len());
                for (column, value) in record.iter() {
                    row.push(column, cell_text(column, value)?);
                }
                Ok(row)
            }
        }
    }
}

fn cell_text(column: &str, value: &Value) -> Result<String, ProjectionError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        Value::Unsupported(kind) => Err(ProjectionError {
            column: column.to_string(),
            kind: *kind,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Option<Arc<[String]>> {
        Some(names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn the_one_where_explicit_columns_pick_and_order_the_cells() -> anyhow::Result<()> {
        let record = Record::new()
            .with("id", 7)
            .with("name", "Ross")
            .with("on_a_break", true)
            .with("nested", Value::Unsupported("map"));
        let projector = RowProjector::new(columns(&["name", "id", "missing", "on_a_break"]));

        let row = projector.project(&record)?;

        let cols: Vec<&str> = row.columns().collect();
        let vals: Vec<&str> = row.values().collect();
        assert_eq!(cols, vec!["name", "id", "missing", "on_a_break"]);
        assert_eq!(vals, vec!["Ross", "7", "", "true"]);
        Ok(())
    }

    #[test]
    fn the_one_where_implicit_columns_follow_the_record() -> anyhow::Result<()> {
        let record = Record::new()
            .with("b", "second-alphabetically")
            .with("a", Value::Null);
        let row = RowProjector::new(None).project(&record)?;

        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(row.get("a"), Some(""));
        Ok(())
    }

    #[test]
    fn the_one_where_nested_values_are_refused_by_name() {
        let record = Record::new().with("tags", Value::Unsupported("list"));

        let explicit = RowProjector::new(columns(&["tags"])).project(&record);
        assert_eq!(
            explicit,
            Err(ProjectionError {
                column: "tags".into(),
                kind: "list"
            })
        );
        assert!(RowProjector::new(None).project(&record).is_err());
    }
}
