//! Declared method signatures.

use serde::{Deserialize, Serialize};

use super::{DataType, Value, RANK_ONE_DIMENSION, RANK_SCALAR};

/// One declared input or output argument of a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub data_type: DataType,
    pub value_rank: i64,
    /// Optional arguments may be omitted from the tail of a call, or passed
    /// as Null in the middle of one.
    pub optional: bool,
}

impl Argument {
    pub fn scalar(name: impl Into<String>, data_type: DataType) -> Self {
        Self { name: name.into(), data_type, value_rank: RANK_SCALAR, optional: false }
    }

    pub fn array(name: impl Into<String>, data_type: DataType) -> Self {
        Self { name: name.into(), data_type, value_rank: RANK_ONE_DIMENSION, optional: false }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Whether a call-site value satisfies this argument. Null counts as
    /// "absent" and is only accepted where the argument is optional.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return self.optional;
        }
        match self.value_rank {
            RANK_ONE_DIMENSION => match value {
                Value::List(items) => items.iter().all(|v| v.conforms_to(self.data_type)),
                _ => false,
            },
            _ => value.conforms_to(self.data_type),
        }
    }
}
