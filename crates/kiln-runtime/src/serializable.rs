//! Explicit serialization capability for values plugins hand to the runtime.
//!
//! Job results and metric values are stored as JSON. A plugin type opts in by
//! implementing [`Serializable`]; anything else can still be recorded through
//! its raw string representation.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// A value that knows how to present itself as JSON.
pub trait Serializable: Send + Sync {
    fn to_value(&self) -> Value;
}

impl Serializable for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl Serializable for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }
}

impl Serializable for str {
    fn to_value(&self) -> Value {
        Value::String(self.to_string())
    }
}

/// Serialize `value` with serde, falling back to its `Debug` representation.
pub fn to_json_or_raw<T: Serialize + fmt::Debug + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| Value::String(format!("{:?}", value)))
}

/// What a job handler produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum JobOutput {
    /// The handler returned nothing worth recording.
    #[default]
    Empty,
    /// A structured result.
    Value(Value),
    /// Raw string representation of a value with no JSON form.
    Raw(String),
}

impl JobOutput {
    pub fn from_serializable(value: &dyn Serializable) -> Self {
        JobOutput::Value(value.to_value())
    }

    /// Serialize any serde value; non-serializable data degrades to `Raw`.
    pub fn json<T: Serialize + fmt::Debug + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => JobOutput::Value(value),
            Err(_) => JobOutput::Raw(format!("{:?}", value)),
        }
    }

    pub fn raw(value: impl fmt::Display) -> Self {
        JobOutput::Raw(value.to_string())
    }

    /// The JSON form stored on the job.
    pub fn into_value(self) -> Option<Value> {
        match self {
            JobOutput::Empty => None,
            JobOutput::Value(value) => Some(value),
            JobOutput::Raw(raw) => Some(Value::String(raw)),
        }
    }
}

impl From<Value> for JobOutput {
    fn from(value: Value) -> Self {
        JobOutput::Value(value)
    }
}

impl From<()> for JobOutput {
    fn from(_: ()) -> Self {
        JobOutput::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct Coverage {
        lines: u32,
        hit: u32,
    }

    impl Serializable for Coverage {
        fn to_value(&self) -> Value {
            json!({ "lines": self.lines, "hit": self.hit })
        }
    }

    #[test]
    fn test_serializable_output() {
        let output = JobOutput::from_serializable(&Coverage { lines: 10, hit: 7 });
        assert_eq!(output.into_value(), Some(json!({"lines": 10, "hit": 7})));
    }

    #[test]
    fn test_json_falls_back_to_raw() {
        // Non-string map keys cannot be represented in JSON.
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        let output = JobOutput::json(&map);
        assert!(matches!(output, JobOutput::Raw(_)));

        assert_eq!(
            JobOutput::json(&vec![1, 2]).into_value(),
            Some(json!([1, 2]))
        );
    }

    #[test]
    fn test_empty_output_has_no_value() {
        assert_eq!(JobOutput::from(()).into_value(), None);
        assert_eq!(JobOutput::raw(42).into_value(), Some(json!("42")));
    }
}
