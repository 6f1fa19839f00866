//! Runtime value representation
//!
//! The constant pool handed to the back-end is a list of these values. The
//! optimizer reads them (truthiness queries, tuple folding) and appends new
//! entries, but never mutates or removes existing ones.

use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// A runtime value, as it appears in a code unit's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// String value (reference-counted)
    Str(Rc<String>),
    /// Immutable tuple of values (reference-counted)
    Tuple(Rc<Vec<Value>>),
    /// A host object injected into the pool by the embedder. The back-end
    /// cannot query it; predicates over it belong to the runtime.
    Foreign(Rc<ForeignConst>),
}

/// An opaque constant owned by the host. Only its type name is visible to
/// the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignConst {
    /// Host-side type name, for diagnostics only.
    pub type_name: String,
}

/// Error raised when a compile-time truthiness query cannot be answered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TruthinessError {
    /// The constant is a foreign object; deciding its truthiness would
    /// require calling into the runtime.
    #[error("foreign constant of type `{type_name}` must be queried at run time")]
    Foreign {
        /// Host-side type name of the offending constant.
        type_name: String,
    },
}

impl Value {
    /// Create a new string value
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Rc::new(s.into()))
    }

    /// Create a new tuple value
    pub fn tuple(values: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(values))
    }

    /// Create a new foreign constant
    pub fn foreign(type_name: impl Into<String>) -> Self {
        Value::Foreign(Rc::new(ForeignConst {
            type_name: type_name.into(),
        }))
    }

    /// Decide this value's truthiness at compile time.
    ///
    /// Fails for foreign constants: their `bool` conversion is a runtime
    /// dispatch the compiler must not anticipate.
    pub fn truthiness(&self) -> Result<bool, TruthinessError> {
        match self {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::Str(s) => Ok(!s.is_empty()),
            Value::Tuple(t) => Ok(!t.is_empty()),
            Value::Foreign(f) => Err(TruthinessError::Foreign {
                type_name: f.type_name.clone(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Foreign(fc) => write!(f, "<foreign {}>", fc.type_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness_of_literals() {
        assert_eq!(Value::Null.truthiness(), Ok(false));
        assert_eq!(Value::Bool(true).truthiness(), Ok(true));
        assert_eq!(Value::Int(0).truthiness(), Ok(false));
        assert_eq!(Value::Int(-3).truthiness(), Ok(true));
        assert_eq!(Value::Float(0.0).truthiness(), Ok(false));
        assert_eq!(Value::string("").truthiness(), Ok(false));
        assert_eq!(Value::string("x").truthiness(), Ok(true));
        assert_eq!(Value::tuple(vec![]).truthiness(), Ok(false));
        assert_eq!(Value::tuple(vec![Value::Null]).truthiness(), Ok(true));
    }

    #[test]
    fn test_foreign_truthiness_is_an_error() {
        let err = Value::foreign("Window").truthiness().unwrap_err();
        assert_eq!(
            err,
            TruthinessError::Foreign {
                type_name: "Window".to_string()
            }
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(
            Value::tuple(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "(1, 2)"
        );
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::string("hi").to_string(), "\"hi\"");
    }
}
