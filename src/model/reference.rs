//! Typed references (edges) between nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Semantic label on a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceType {
    Organizes,
    HasComponent,
    HasProperty,
    HasSubtype,
    HasTypeDefinition,
    GeneratesEvent,
}

impl ReferenceType {
    /// Hierarchical references define the parent/child containment used by
    /// browse-path resolution.
    pub fn is_hierarchical(&self) -> bool {
        matches!(
            self,
            ReferenceType::Organizes | ReferenceType::HasComponent | ReferenceType::HasProperty
        )
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReferenceType::Organizes => "Organizes",
            ReferenceType::HasComponent => "HasComponent",
            ReferenceType::HasProperty => "HasProperty",
            ReferenceType::HasSubtype => "HasSubtype",
            ReferenceType::HasTypeDefinition => "HasTypeDefinition",
            ReferenceType::GeneratesEvent => "GeneratesEvent",
        };
        f.write_str(s)
    }
}

/// Which way to follow references from a starting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrowseDirection {
    Forward,
    Inverse,
}

/// One endpoint's view of an edge. Every edge is stored twice: a Forward
/// entry on the source and an Inverse entry on the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub ty: ReferenceType,
    pub direction: BrowseDirection,
    pub target: NodeId,
}

impl Reference {
    pub fn forward(ty: ReferenceType, target: NodeId) -> Self {
        Self { ty, direction: BrowseDirection::Forward, target }
    }

    pub fn inverse(ty: ReferenceType, target: NodeId) -> Self {
        Self { ty, direction: BrowseDirection::Inverse, target }
    }
}
