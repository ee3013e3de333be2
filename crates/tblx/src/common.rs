//! 📦 Common data structures: the building blocks of tblx.
//!
//! 🎬 INT. DATA CENTER, 3:47 AM. A `Record` arrives from the table, carrying its
//! attributes like groceries in one trip. The projector flattens it into a `Row`.
//! The sink writes the `Row` into a file named by a `FileKey`. Nobody asks how
//! the record feels about being flattened. Relatable.
//!
//! These structs are the postal workers of this codebase. They carry data from
//! the table API to the delimited text files and never open the envelope.

use std::fmt;

/// 🎯 One scalar attribute value, as read from the table.
///
/// Numbers keep their decimal text. The table API hands them over as strings
/// (DynamoDB `N`), and round-tripping through `f64` would be a crime against
/// every 19-digit order id out there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Number(String),
    Bool(bool),
    Null,
    /// ⚠️ Anything we refuse to flatten (lists, maps, sets, binary). The payload
    /// is the kind name, for the error message.
    Unsupported(&'static str),
}

impl Value {
    /// 🏷️ Short kind name, used in projection errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Null => "null",
            Value::Unsupported(kind) => *kind,
        }
    }

    /// 🔄 Map a JSON value onto a table value. Arrays and objects stay unsupported.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Number(n) => Value::Number(n.to_string()),
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Array(_) => Value::Unsupported("array"),
            serde_json::Value::Object(_) => Value::Unsupported("object"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

macro_rules! number_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Number(n.to_string())
            }
        })*
    };
}

number_from!(i32, i64, u32, u64, usize);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// 📦 A `Record`: one item from the table, attribute name → value.
///
/// Ordered on purpose. "The record's natural order" is the order attributes were
/// pushed in, and implicit-header files inherit it from their first record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    attributes: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🏗️ Builder-style push. Re-using a name replaces the earlier value in place.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// 🔄 Build a record from a JSON object. Key order is whatever the map iterates
    /// in, which for `serde_json::Map` without `preserve_order` is lexicographic.
    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        object
            .iter()
            .map(|(name, value)| (name.clone(), Value::from_json(value)))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

/// 📄 A flat `Row`: column name → text, column order = insertion order.
///
/// Derived once from a `Record`, never mutated afterwards. The sink decides which
/// header it belongs under; the row just knows its own cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.cells.push((column.into(), value.into()));
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(column, _)| column.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(_, value)| value.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(existing, _)| existing == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// ✅ True when this row's columns are exactly `header`, in that order.
    pub(crate) fn matches_header(&self, header: &[String]) -> bool {
        self.len() == header.len()
            && self
                .cells
                .iter()
                .zip(header)
                .all(|((column, _), expected)| column == expected)
    }
}

/// 🗝️ Identity of one output file: `(table, segment, file_index)`, plus whether
/// it is gzipped (which changes the extension).
///
/// Layout on disk / in the bucket: `{table}/{table}-{segment}-{file_index}.csv[.gz]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub table: String,
    pub segment: u32,
    pub file_index: u32,
    pub compressed: bool,
}

impl FileKey {
    pub fn new(table: impl Into<String>, segment: u32, file_index: u32, compressed: bool) -> Self {
        Self {
            table: table.into(),
            segment,
            file_index,
            compressed,
        }
    }

    /// 📄 `orders-3-0.csv.gz`
    pub fn file_name(&self) -> String {
        let mut name = format!("{}-{}-{}.csv", self.table, self.segment, self.file_index);
        if self.compressed {
            name.push_str(".gz");
        }
        name
    }

    /// 📂 `orders/orders-3-0.csv.gz`, relative to whatever root the store uses.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.table, self.file_name())
    }

    /// 🔄 The same file slot, one index later. Rotation in one line.
    pub fn next(&self) -> Self {
        Self {
            file_index: self.file_index + 1,
            ..self.clone()
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}
