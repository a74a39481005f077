//! Keyword argument access for operation constructors.
//!
//! Arguments are passed as a single object literal. Every accessor marks the
//! argument as used; after construction the evaluator reports any argument
//! that was never read as an `extra arguments` error.

use std::collections::{HashMap, HashSet};

use common_error::{RivuletError, RivuletResult};
use rivulet_core::{Duration, Expression, Time, TimeSpec};

use crate::value::{Array, Value, ValueKind};

/// Access to the keyword arguments passed to a function or method.
#[derive(Debug, Default)]
pub struct Arguments {
    params: HashMap<String, Value>,
    used: HashSet<String>,
}

impl Arguments {
    /// Wrap a resolved parameter map.
    pub fn new(params: HashMap<String, Value>) -> Self {
        Self {
            params,
            used: HashSet::new(),
        }
    }

    fn get(
        &mut self,
        name: &str,
        kind: ValueKind,
        required: bool,
    ) -> RivuletResult<Option<&Value>> {
        self.used.insert(name.to_string());
        match self.params.get(name) {
            None if required => Err(RivuletError::evaluation(format!(
                "missing required keyword argument {name:?}"
            ))),
            None => Ok(None),
            Some(v) if v.kind() != kind => Err(RivuletError::evaluation(format!(
                "keyword argument {name:?} should be of type {kind}, but got {}",
                v.kind()
            ))),
            Some(v) => Ok(Some(v)),
        }
    }

    /// Get an optional string argument.
    pub fn get_string(&mut self, name: &str) -> RivuletResult<Option<String>> {
        Ok(self.get(name, ValueKind::String, false)?.map(|v| match v {
            Value::String(s) => s.clone(),
            _ => unreachable!("kind checked"),
        }))
    }

    /// Get a required string argument.
    pub fn get_required_string(&mut self, name: &str) -> RivuletResult<String> {
        match self.get(name, ValueKind::String, true)? {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => unreachable!("kind checked"),
        }
    }

    /// Get an optional integer argument.
    pub fn get_int(&mut self, name: &str) -> RivuletResult<Option<i64>> {
        Ok(self.get(name, ValueKind::Int, false)?.map(|v| match v {
            Value::Int(i) => *i,
            _ => unreachable!("kind checked"),
        }))
    }

    /// Get a required integer argument.
    pub fn get_required_int(&mut self, name: &str) -> RivuletResult<i64> {
        match self.get(name, ValueKind::Int, true)? {
            Some(Value::Int(i)) => Ok(*i),
            _ => unreachable!("kind checked"),
        }
    }

    /// Get an optional float argument.
    pub fn get_float(&mut self, name: &str) -> RivuletResult<Option<f64>> {
        Ok(self.get(name, ValueKind::Float, false)?.map(|v| match v {
            Value::Float(f) => *f,
            _ => unreachable!("kind checked"),
        }))
    }

    /// Get an optional boolean argument.
    pub fn get_bool(&mut self, name: &str) -> RivuletResult<Option<bool>> {
        Ok(self.get(name, ValueKind::Bool, false)?.map(|v| match v {
            Value::Bool(b) => *b,
            _ => unreachable!("kind checked"),
        }))
    }

    /// Get an optional duration argument.
    pub fn get_duration(&mut self, name: &str) -> RivuletResult<Option<Duration>> {
        Ok(self.get(name, ValueKind::Duration, false)?.map(|v| match v {
            Value::Duration(d) => *d,
            _ => unreachable!("kind checked"),
        }))
    }

    /// Get a required duration argument.
    pub fn get_required_duration(&mut self, name: &str) -> RivuletResult<Duration> {
        match self.get(name, ValueKind::Duration, true)? {
            Some(Value::Duration(d)) => Ok(*d),
            _ => unreachable!("kind checked"),
        }
    }

    /// Get an optional time argument. Times are absolute, durations are
    /// relative to `now`, and bare integers are absolute seconds.
    pub fn get_time(&mut self, name: &str) -> RivuletResult<Option<TimeSpec>> {
        self.used.insert(name.to_string());
        match self.params.get(name) {
            None => Ok(None),
            Some(Value::Time(t)) => Ok(Some(TimeSpec::Absolute(*t))),
            Some(Value::Duration(d)) => Ok(Some(TimeSpec::Relative(*d))),
            Some(Value::Int(secs)) => Ok(Some(TimeSpec::Absolute(Time(
                secs.saturating_mul(1_000_000_000),
            )))),
            Some(v) => Err(RivuletError::evaluation(format!(
                "keyword argument {name:?} is not a time, got {}",
                v.kind()
            ))),
        }
    }

    /// Get a required time argument.
    pub fn get_required_time(&mut self, name: &str) -> RivuletResult<TimeSpec> {
        self.get_time(name)?.ok_or_else(|| {
            RivuletError::evaluation(format!("missing required keyword argument {name:?}"))
        })
    }

    /// Get an optional array argument of a given element kind.
    pub fn get_array(&mut self, name: &str, kind: ValueKind) -> RivuletResult<Option<Array>> {
        match self.get(name, ValueKind::Array, false)? {
            None => Ok(None),
            Some(Value::Array(arr)) => {
                if arr.kind != kind && !arr.elements.is_empty() {
                    return Err(RivuletError::evaluation(format!(
                        "keyword argument {name:?} should be an array of type {kind}, \
                         but got an array of type {}",
                        arr.kind
                    )));
                }
                Ok(Some(arr.clone()))
            }
            _ => unreachable!("kind checked"),
        }
    }

    /// Get a required array argument of a given element kind.
    pub fn get_required_array(&mut self, name: &str, kind: ValueKind) -> RivuletResult<Array> {
        match self.get_array(name, kind)? {
            Some(arr) => Ok(arr),
            None => Err(RivuletError::evaluation(format!(
                "missing required keyword argument {name:?}"
            ))),
        }
    }

    /// Get an optional expression argument.
    pub fn get_expression(&mut self, name: &str) -> RivuletResult<Option<Expression>> {
        Ok(self
            .get(name, ValueKind::Expression, false)?
            .map(|v| match v {
                Value::Expression(e) => e.clone(),
                _ => unreachable!("kind checked"),
            }))
    }

    /// Get a required expression argument.
    pub fn get_required_expression(&mut self, name: &str) -> RivuletResult<Expression> {
        match self.get(name, ValueKind::Expression, true)? {
            Some(Value::Expression(e)) => Ok(e.clone()),
            _ => unreachable!("kind checked"),
        }
    }

    /// The provided arguments that no accessor has read, sorted for
    /// deterministic error messages.
    pub fn list_unused(&self) -> Vec<String> {
        let mut unused: Vec<String> = self
            .params
            .keys()
            .filter(|k| !self.used.contains(*k))
            .cloned()
            .collect();
        unused.sort();
        unused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: Vec<(&str, Value)>) -> Arguments {
        Arguments::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn test_typed_access() {
        let mut a = args(vec![
            ("db", Value::String("mydb".to_string())),
            ("n", Value::Int(5)),
        ]);
        assert_eq!(a.get_required_string("db").unwrap(), "mydb");
        assert_eq!(a.get_int("n").unwrap(), Some(5));
        assert_eq!(a.get_int("missing").unwrap(), None);
        assert!(a.list_unused().is_empty());
    }

    #[test]
    fn test_type_mismatch() {
        let mut a = args(vec![("db", Value::Int(3))]);
        let err = a.get_required_string("db").unwrap_err();
        assert!(err.to_string().contains("should be of type string"));
    }

    #[test]
    fn test_missing_required() {
        let mut a = args(vec![]);
        let err = a.get_required_string("db").unwrap_err();
        assert!(err.to_string().contains("missing required keyword argument"));
    }

    #[test]
    fn test_time_coercions() {
        let mut a = args(vec![
            ("start", Value::Duration(Duration::hours(-1))),
            ("stop", Value::Time(Time(100))),
            ("epoch", Value::Int(2)),
        ]);
        assert_eq!(
            a.get_required_time("start").unwrap(),
            TimeSpec::Relative(Duration::hours(-1))
        );
        assert_eq!(
            a.get_time("stop").unwrap(),
            Some(TimeSpec::Absolute(Time(100)))
        );
        assert_eq!(
            a.get_time("epoch").unwrap(),
            Some(TimeSpec::Absolute(Time(2_000_000_000)))
        );
    }

    #[test]
    fn test_unused_tracking() {
        let mut a = args(vec![
            ("db", Value::String("mydb".to_string())),
            ("bogus", Value::Int(1)),
            ("also", Value::Int(2)),
        ]);
        let _ = a.get_required_string("db").unwrap();
        assert_eq!(a.list_unused(), vec!["also".to_string(), "bogus".to_string()]);
    }
}
