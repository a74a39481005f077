//! Column data types and runtime values.

use serde::{Deserialize, Serialize};

use crate::time::{Duration, Time};

/// The closed set of column data types carried by blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit unsigned integer.
    UInt,
    /// 64-bit floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Nanosecond instant.
    Time,
}

/// The data types a value column may take. The time column is always
/// [`DataType::Time`] and is excluded here.
pub const VALUE_DATA_TYPES: [DataType; 5] = [
    DataType::Bool,
    DataType::Int,
    DataType::UInt,
    DataType::Float,
    DataType::String,
];

impl DataType {
    /// Type name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::String => "string",
            Self::Time => "time",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single runtime value, as read out of a block row or produced by
/// expression evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit unsigned integer.
    UInt(u64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Nanosecond instant.
    Time(Time),
    /// Signed nanosecond span. Only produced by expression arithmetic.
    Duration(Duration),
}

impl Value {
    /// The column data type of this value, if it has one.
    pub const fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Bool(_) => Some(DataType::Bool),
            Self::Int(_) => Some(DataType::Int),
            Self::UInt(_) => Some(DataType::UInt),
            Self::Float(_) => Some(DataType::Float),
            Self::String(_) => Some(DataType::String),
            Self::Time(_) => Some(DataType::Time),
            Self::Duration(_) => None,
        }
    }

    /// Type name used in error messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Time(_) => "time",
            Self::Duration(_) => "duration",
        }
    }

    /// Try to get as boolean.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as u64.
    pub const fn as_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(u) => Some(*u),
            _ => None,
        }
    }

    /// Try to get as f64, promoting integers.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as a time instant.
    pub const fn as_time(&self) -> Option<Time> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{v}"),
            Self::Duration(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_data_types() {
        assert_eq!(Value::Int(1).data_type(), Some(DataType::Int));
        assert_eq!(Value::Duration(Duration(5)).data_type(), None);
        assert_eq!(
            Value::String("cpu".to_string()).data_type(),
            Some(DataType::String)
        );
    }

    #[test]
    fn test_float_promotion() {
        assert_eq!(Value::Int(2).as_float(), Some(2.0));
        assert_eq!(Value::UInt(3).as_float(), Some(3.0));
        assert_eq!(Value::Bool(true).as_float(), None);
    }
}
