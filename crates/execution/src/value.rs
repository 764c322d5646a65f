//! Row values flowing between operators.
//!
//! Equality, hashing and ordering on [`ScalarValue`] are structural (variant
//! first, then value) so that grouping and sorting behave inside one typed
//! column. SQL comparison semantics with numeric coercion live in
//! [`crate::eval`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use arrow_schema::DataType;
use svq_common::{Result, SvqError};
use svq_planner::LiteralValue;

/// One row: values aligned to the emitting node's [`svq_planner::RowSchema`].
pub type Row = Vec<ScalarValue>;

/// A single dynamically typed value.
#[derive(Debug, Clone)]
pub enum ScalarValue {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Integer value (every signed/unsigned integer column maps here).
    Int64(i64),
    /// Floating point value.
    Float64(f64),
    /// Text value.
    Utf8(String),
}

impl ScalarValue {
    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Numeric view used by arithmetic aggregates and numeric comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int64(v) => Some(*v as f64),
            ScalarValue::Float64(v) => Some(*v),
            ScalarValue::Utf8(s) => s.trim().parse().ok(),
            ScalarValue::Boolean(_) | ScalarValue::Null => None,
        }
    }

    /// Text view used by `LIKE` and string comparisons.
    pub fn as_text(&self) -> Option<String> {
        match self {
            ScalarValue::Null => None,
            ScalarValue::Utf8(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Convert to the value family of `to`.
    pub fn cast_to(&self, to: &DataType) -> Result<ScalarValue> {
        let out = match (self, family(to)?) {
            (ScalarValue::Null, _) | (_, Family::Null) => ScalarValue::Null,
            (ScalarValue::Int64(_), Family::Int)
            | (ScalarValue::Float64(_), Family::Float)
            | (ScalarValue::Utf8(_), Family::Text)
            | (ScalarValue::Boolean(_), Family::Bool) => self.clone(),
            (v, Family::Text) => ScalarValue::Utf8(v.to_string()),
            (ScalarValue::Int64(v), Family::Float) => ScalarValue::Float64(*v as f64),
            (ScalarValue::Float64(v), Family::Int) if v.fract() == 0.0 => {
                ScalarValue::Int64(*v as i64)
            }
            (ScalarValue::Boolean(b), Family::Int) => ScalarValue::Int64(i64::from(*b)),
            (ScalarValue::Utf8(s), Family::Int) => {
                ScalarValue::Int64(s.trim().parse().map_err(|_| cast_error(self, to))?)
            }
            (ScalarValue::Utf8(s), Family::Float) => {
                ScalarValue::Float64(s.trim().parse().map_err(|_| cast_error(self, to))?)
            }
            (ScalarValue::Utf8(s), Family::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "y" | "1" => ScalarValue::Boolean(true),
                "false" | "n" | "0" => ScalarValue::Boolean(false),
                _ => return Err(cast_error(self, to)),
            },
            _ => return Err(cast_error(self, to)),
        };
        Ok(out)
    }

    fn rank(&self) -> u8 {
        match self {
            ScalarValue::Null => 0,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Int64(_) => 2,
            ScalarValue::Float64(_) => 3,
            ScalarValue::Utf8(_) => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Null,
    Bool,
    Int,
    Float,
    Text,
}

fn family(dt: &DataType) -> Result<Family> {
    Ok(match dt {
        DataType::Null => Family::Null,
        DataType::Boolean => Family::Bool,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => Family::Int,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => Family::Float,
        DataType::Utf8 | DataType::LargeUtf8 => Family::Text,
        other => {
            return Err(SvqError::Unsupported(format!(
                "row values of type {other:?} are not supported"
            )))
        }
    })
}

fn cast_error(v: &ScalarValue, to: &DataType) -> SvqError {
    SvqError::Execution(format!("cannot convert value '{v}' to {to:?}"))
}

impl From<&LiteralValue> for ScalarValue {
    fn from(v: &LiteralValue) -> Self {
        match v {
            LiteralValue::Int64(i) => ScalarValue::Int64(*i),
            LiteralValue::Float64(f) => ScalarValue::Float64(*f),
            LiteralValue::Utf8(s) => ScalarValue::Utf8(s.clone()),
            LiteralValue::Boolean(b) => ScalarValue::Boolean(*b),
            LiteralValue::Null => ScalarValue::Null,
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(v.to_string())
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(v)
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarValue {}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// NULL sorts first.
impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => a.cmp(b),
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a.cmp(b),
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => a.total_cmp(b),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ScalarValue::Null => {}
            ScalarValue::Boolean(b) => b.hash(state),
            ScalarValue::Int64(v) => v.hash(state),
            ScalarValue::Float64(v) => v.to_bits().hash(state),
            ScalarValue::Utf8(s) => s.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => f.write_str("NULL"),
            ScalarValue::Boolean(b) => write!(f, "{b}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(s) => f.write_str(s),
        }
    }
}
