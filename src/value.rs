use crate::error::TuskerError;

/// A value that can cross the driver boundary: either a bind parameter or
/// a parsed result cell.
///
/// The same enum is used on both sides of a query so helper code never
/// branches on driver types:
/// ```rust
/// use tusker::prelude::*;
///
/// let params = vec![
///     PrimitiveValue::Int(1),
///     PrimitiveValue::Text("alice".into()),
///     PrimitiveValue::Bool(true),
/// ];
/// # let _ = params;
/// ```
///
/// There is no variant for objects, functions, or non-finite numbers;
/// those are rejected when a fragment is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit, always finite)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// A readonly array of primitives (possibly nested)
    Array(Vec<PrimitiveValue>),
}

impl PrimitiveValue {
    /// Construct a float value, rejecting `NaN` and infinities up front
    /// so downstream stages can assume well-formedness.
    ///
    /// # Errors
    /// Returns `TuskerError::InvalidInput` for non-finite input.
    pub fn float(value: f64) -> Result<Self, TuskerError> {
        if value.is_finite() {
            Ok(PrimitiveValue::Float(value))
        } else {
            Err(TuskerError::InvalidInput(format!(
                "non-finite number {value} cannot be bound"
            )))
        }
    }

    /// Check that this value (and every element of a nested array) is
    /// finite. Guards values assembled without going through `float`.
    pub(crate) fn ensure_finite(&self) -> Result<(), TuskerError> {
        match self {
            PrimitiveValue::Float(f) if !f.is_finite() => Err(TuskerError::InvalidInput(
                format!("non-finite number {f} cannot be bound"),
            )),
            PrimitiveValue::Array(members) => {
                for member in members {
                    member.ensure_finite()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        if let PrimitiveValue::Bool(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        if let PrimitiveValue::Int(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            PrimitiveValue::Float(value) => Some(*value),
            PrimitiveValue::Int(value) => {
                // Lossless for the magnitudes the wire delivers as ints.
                #[allow(clippy::cast_precision_loss)]
                Some(*value as f64)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let PrimitiveValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if let PrimitiveValue::Bytes(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[PrimitiveValue]> {
        if let PrimitiveValue::Array(members) = self {
            Some(members)
        } else {
            None
        }
    }
}

impl From<bool> for PrimitiveValue {
    fn from(value: bool) -> Self {
        PrimitiveValue::Bool(value)
    }
}

impl From<i32> for PrimitiveValue {
    fn from(value: i32) -> Self {
        PrimitiveValue::Int(i64::from(value))
    }
}

impl From<i64> for PrimitiveValue {
    fn from(value: i64) -> Self {
        PrimitiveValue::Int(value)
    }
}

impl From<&str> for PrimitiveValue {
    fn from(value: &str) -> Self {
        PrimitiveValue::Text(value.to_string())
    }
}

impl From<String> for PrimitiveValue {
    fn from(value: String) -> Self {
        PrimitiveValue::Text(value)
    }
}

impl From<Vec<u8>> for PrimitiveValue {
    fn from(value: Vec<u8>) -> Self {
        PrimitiveValue::Bytes(value)
    }
}

impl<T: Into<PrimitiveValue>> From<Option<T>> for PrimitiveValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => PrimitiveValue::Null,
        }
    }
}
