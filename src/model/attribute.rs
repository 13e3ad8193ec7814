//! Typed attributes carried by every node.

use std::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use super::{DataType, Value};

/// AccessLevel / UserAccessLevel bit flags.
pub const ACCESS_CURRENT_READ: i64 = 0x01;
pub const ACCESS_CURRENT_WRITE: i64 = 0x02;

/// ValueRank markers: a scalar slot or a one-dimensional array slot.
pub const RANK_SCALAR: i64 = -1;
pub const RANK_ONE_DIMENSION: i64 = 1;

/// Attribute selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeId {
    Value,
    DataType,
    ValueRank,
    AccessLevel,
    UserAccessLevel,
    Historizing,
    EventNotifier,
    IsAbstract,
    DisplayName,
    Description,
}

impl AttributeId {
    /// Declared type of the fixed-typed attributes. Value has none here: it
    /// is checked against the node's own DataType attribute instead.
    pub fn fixed_type(&self) -> Option<DataType> {
        match self {
            AttributeId::Value => None,
            AttributeId::DataType | AttributeId::DisplayName | AttributeId::Description => {
                Some(DataType::String)
            }
            AttributeId::ValueRank | AttributeId::AccessLevel | AttributeId::UserAccessLevel => {
                Some(DataType::Int)
            }
            AttributeId::Historizing | AttributeId::EventNotifier | AttributeId::IsAbstract => {
                Some(DataType::Bool)
            }
        }
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttributeId::Value => "Value",
            AttributeId::DataType => "DataType",
            AttributeId::ValueRank => "ValueRank",
            AttributeId::AccessLevel => "AccessLevel",
            AttributeId::UserAccessLevel => "UserAccessLevel",
            AttributeId::Historizing => "Historizing",
            AttributeId::EventNotifier => "EventNotifier",
            AttributeId::IsAbstract => "IsAbstract",
            AttributeId::DisplayName => "DisplayName",
            AttributeId::Description => "Description",
        };
        f.write_str(s)
    }
}

/// The attribute map of one node, with class-shaped constructors.
///
/// The DataType attribute is stored as its canonical name
/// (see [`DataType::name`]) so the map stays homogeneous.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttributeSet(HashMap<AttributeId, Value>);

impl AttributeSet {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Variable shape: typed current value, scalar rank, read/write access,
    /// historizing off.
    pub fn variable(data_type: DataType, initial: impl Into<Value>) -> Self {
        Self::new()
            .with(AttributeId::Value, initial)
            .with(AttributeId::DataType, data_type.name())
            .with(AttributeId::ValueRank, RANK_SCALAR)
            .with(AttributeId::AccessLevel, ACCESS_CURRENT_READ | ACCESS_CURRENT_WRITE)
            .with(AttributeId::UserAccessLevel, ACCESS_CURRENT_READ | ACCESS_CURRENT_WRITE)
            .with(AttributeId::Historizing, false)
    }

    /// Property shape: typed value, read-only access.
    pub fn property(data_type: DataType, value: impl Into<Value>) -> Self {
        Self::new()
            .with(AttributeId::Value, value)
            .with(AttributeId::DataType, data_type.name())
            .with(AttributeId::ValueRank, RANK_SCALAR)
            .with(AttributeId::AccessLevel, ACCESS_CURRENT_READ)
            .with(AttributeId::UserAccessLevel, ACCESS_CURRENT_READ)
    }

    /// Object shape: not an event notifier until marked as one.
    pub fn object() -> Self {
        Self::new().with(AttributeId::EventNotifier, false)
    }

    /// ObjectType shape.
    pub fn object_type(is_abstract: bool) -> Self {
        Self::new().with(AttributeId::IsAbstract, is_abstract)
    }

    pub fn with(mut self, id: AttributeId, value: impl Into<Value>) -> Self {
        self.0.insert(id, value.into());
        self
    }

    pub fn insert(&mut self, id: AttributeId, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(id, value.into())
    }

    pub fn get(&self, id: AttributeId) -> Option<&Value> {
        self.0.get(&id)
    }

    pub fn contains(&self, id: AttributeId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeId, &Value)> {
        self.0.iter()
    }

    pub fn declared_type(&self) -> Option<DataType> {
        self.get(AttributeId::DataType)
            .and_then(Value::as_str)
            .and_then(DataType::from_name)
    }

    pub fn value_rank(&self) -> i64 {
        self.get(AttributeId::ValueRank)
            .and_then(Value::as_int)
            .unwrap_or(RANK_SCALAR)
    }

    pub fn historizing(&self) -> bool {
        self.get(AttributeId::Historizing)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_abstract(&self) -> bool {
        self.get(AttributeId::IsAbstract)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn event_notifier(&self) -> bool {
        self.get(AttributeId::EventNotifier)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Checks a candidate Value write against the declared type and rank.
    /// Untyped slots accept anything.
    pub fn conforms(&self, value: &Value) -> bool {
        let Some(data_type) = self.declared_type() else {
            return true;
        };
        if value.is_null() {
            return true;
        }
        match self.value_rank() {
            RANK_ONE_DIMENSION => match value {
                Value::List(items) => items.iter().all(|v| v.conforms_to(data_type)),
                _ => false,
            },
            _ => value.conforms_to(data_type),
        }
    }
}
