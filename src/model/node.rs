//! Nodes in the address space.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{AttributeId, AttributeSet, Value};

/// Node identifier: namespace index plus a numeric or string identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    Numeric(u32),
    String(String),
}

impl NodeId {
    pub const fn numeric(namespace: u16, id: u32) -> Self {
        Self { namespace, identifier: Identifier::Numeric(id) }
    }

    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        Self { namespace, identifier: Identifier::String(id.into()) }
    }

    // Well-known namespace-0 layout. The numeric values follow the classic
    // node set so browse paths line up across peers.
    pub const ROOT_FOLDER: NodeId = NodeId::numeric(0, 84);
    pub const OBJECTS_FOLDER: NodeId = NodeId::numeric(0, 85);
    pub const TYPES_FOLDER: NodeId = NodeId::numeric(0, 86);
    pub const OBJECT_TYPES_FOLDER: NodeId = NodeId::numeric(0, 88);
    pub const SERVER: NodeId = NodeId::numeric(0, 2253);
    pub const BASE_EVENT_TYPE: NodeId = NodeId::numeric(0, 2041);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Identifier::Numeric(n) => write!(f, "ns={};i={}", self.namespace, n),
            Identifier::String(s) => write!(f, "ns={};s={}", self.namespace, s),
        }
    }
}

/// What kind of thing a node is. Decides the reference type used to attach
/// it to its parent and which attributes make sense on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeClass {
    Object,
    Variable,
    Property,
    Method,
    ObjectType,
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeClass::Object => "Object",
            NodeClass::Variable => "Variable",
            NodeClass::Property => "Property",
            NodeClass::Method => "Method",
            NodeClass::ObjectType => "ObjectType",
        };
        f.write_str(s)
    }
}

/// Namespace-qualified browse name, unique among the children of one parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub namespace: u16,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: u16, name: impl Into<String>) -> Self {
        Self { namespace, name: name.into() }
    }
}

/// Parses the `"2:SensorValue"` form; a bare name lands in namespace 0.
impl From<&str> for QualifiedName {
    fn from(s: &str) -> Self {
        match s.split_once(':') {
            Some((ns, name)) => match ns.parse::<u16>() {
                Ok(ns) => QualifiedName::new(ns, name),
                Err(_) => QualifiedName::new(0, s),
            },
            None => QualifiedName::new(0, s),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Instantiation rule carried by children of an object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModellingRule {
    Mandatory,
    Optional,
}

/// A node in the address space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub class: NodeClass,
    pub browse_name: QualifiedName,
    pub attributes: AttributeSet,
    /// Only meaningful on children of an object type.
    pub modelling_rule: Option<ModellingRule>,
}

impl Node {
    pub fn new(id: NodeId, class: NodeClass, browse_name: impl Into<QualifiedName>) -> Self {
        Self {
            id,
            class,
            browse_name: browse_name.into(),
            attributes: AttributeSet::new(),
            modelling_rule: None,
        }
    }

    pub fn with_attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_modelling_rule(mut self, rule: ModellingRule) -> Self {
        self.modelling_rule = Some(rule);
        self
    }

    pub fn attribute(&self, id: AttributeId) -> Option<&Value> {
        self.attributes.get(id)
    }

    /// DisplayName attribute, falling back to the browse name.
    pub fn display_name(&self) -> &str {
        self.attributes
            .get(AttributeId::DisplayName)
            .and_then(Value::as_str)
            .unwrap_or(&self.browse_name.name)
    }

    pub fn is_abstract(&self) -> bool {
        self.attributes.is_abstract()
    }

    pub fn historizing(&self) -> bool {
        self.attributes.historizing()
    }
}
