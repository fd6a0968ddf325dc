//! Decoded result rows and column metadata as they arrive from backends.

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// Column type reported by a backend in its field description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Decimal,
    Text,
    Timestamp,
    Date,
    Bytea,
}

/// A single decoded scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Timestamp(i64), // microseconds since Unix epoch
    Date(i32),      // days since Unix epoch
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Timestamp(us) => write!(f, "ts:{}", us),
            Datum::Date(d) => write!(f, "date:{}", d),
            Datum::Bytea(b) => write!(f, "\\x{}", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
        }
    }
}

/// Total order over datums used by ORDER BY merges. NULL sorts first;
/// cross-width integers and floats compare numerically; incomparable
/// type pairs compare equal.
pub fn cmp_datum(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Less,
        (_, Datum::Null) => Ordering::Greater,
        (Datum::Int32(x), Datum::Int32(y)) => x.cmp(y),
        (Datum::Int64(x), Datum::Int64(y)) => x.cmp(y),
        (Datum::Int32(x), Datum::Int64(y)) => (*x as i64).cmp(y),
        (Datum::Int64(x), Datum::Int32(y)) => x.cmp(&(*y as i64)),
        (Datum::Float64(x), Datum::Float64(y)) => x.total_cmp(y),
        (Datum::Float64(x), Datum::Int64(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Datum::Int64(x), Datum::Float64(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::Float64(x), Datum::Int32(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Datum::Int32(x), Datum::Float64(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::Text(x), Datum::Text(y)) => x.cmp(y),
        (Datum::Boolean(x), Datum::Boolean(y)) => x.cmp(y),
        (Datum::Timestamp(x), Datum::Timestamp(y)) => x.cmp(y),
        (Datum::Date(x), Datum::Date(y)) => x.cmp(y),
        (Datum::Bytea(x), Datum::Bytea(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// One decoded row plus the encoded bytes it arrived as, so the row can be
/// re-forwarded to the client without re-encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Datum>,
    raw: Bytes,
}

impl Row {
    pub fn new(values: Vec<Datum>, raw: impl Into<Bytes>) -> Self {
        Self {
            values,
            raw: raw.into(),
        }
    }

    /// Row without an encoded form (locally produced rows, tests).
    pub fn from_values(values: Vec<Datum>) -> Self {
        Self {
            values,
            raw: Bytes::new(),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Column metadata from a backend field description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub org_table: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            schema: None,
            table: None,
            org_table: None,
        }
    }

    /// Replace physical shard names with the logical names the client queried.
    pub fn rewrite_origin(&mut self, schema: Option<&str>, table_alias: Option<&str>, table: Option<&str>) {
        if let Some(schema) = schema {
            self.schema = Some(schema.to_string());
        }
        if let Some(alias) = table_alias {
            self.table = Some(alias.to_string());
        }
        if let Some(table) = table {
            self.org_table = Some(table.to_string());
        }
    }
}
