//! # Node Space Trait
//!
//! THE contract between consumers and an address space. Query helpers, the
//! discovery pass and the aggregation loop are written against it, so the
//! same code runs against the local space and a remote peer.
//!
//! ## Implementations
//!
//! | Space | Module | Description |
//! |-------|--------|-------------|
//! | `AddressSpace` | `memory` | The local in-memory space |
//! | `RemoteSpace` | `remote` | A peer's space over the session layer |

pub mod memory;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;

use crate::history::HistorySample;
use crate::model::{
    AttributeId, BrowseDirection, Node, NodeClass, NodeId, QualifiedName, ReferenceType, Value,
};
use crate::{Error, Result};

pub use memory::AddressSpace;
pub use remote::{RemoteSpace, SessionHub};

/// The callable behind a Method node. Shared between a type's method and its
/// instances' copies.
pub type MethodHandler = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// The universal address-space contract.
///
/// Deliberately small: everything a peer is allowed to do remotely is here,
/// and nothing else. Space construction and subscription management stay on
/// the concrete local type.
#[async_trait]
pub trait NodeSpace: Send + Sync + 'static {
    // ========================================================================
    // Browse
    // ========================================================================

    /// Nodes referenced by `node` in the given direction, in reference
    /// insertion order, optionally filtered by reference type and node
    /// class. A node without matching references browses as empty.
    async fn browse(
        &self,
        node: &NodeId,
        direction: BrowseDirection,
        reference: Option<ReferenceType>,
        class: Option<NodeClass>,
    ) -> Result<Vec<Node>>;

    /// Snapshot of one node.
    async fn node(&self, id: &NodeId) -> Result<Node>;

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Read one attribute.
    async fn get_attribute(&self, node: &NodeId, attribute: AttributeId) -> Result<Value>;

    /// Write one attribute, checked against the node's declared type.
    async fn set_attribute(&self, node: &NodeId, attribute: AttributeId, value: Value)
        -> Result<()>;

    // ========================================================================
    // Methods
    // ========================================================================

    /// Invoke the method node `method` on `owner` with positional arguments.
    async fn invoke_method(&self, owner: &NodeId, method: &NodeId, args: Vec<Value>)
        -> Result<Value>;

    // ========================================================================
    // History
    // ========================================================================

    /// Retained samples of a historized node, newest first.
    async fn read_history(&self, node: &NodeId) -> Result<Vec<HistorySample>>;

    // ========================================================================
    // Convenience (default implementations compose the ops above)
    // ========================================================================

    /// Child of `parent` with the given browse name, resolved among forward
    /// references in one browse.
    async fn find_child(&self, parent: &NodeId, browse_name: &QualifiedName) -> Result<Node> {
        let children = self.browse(parent, BrowseDirection::Forward, None, None).await?;
        children
            .into_iter()
            .find(|n| &n.browse_name == browse_name)
            .ok_or_else(|| Error::NotFound(format!("child {browse_name} of {parent}")))
    }

    /// Walks a browse path segment by segment from `start`.
    async fn resolve_path(&self, start: &NodeId, path: &[QualifiedName]) -> Result<Node> {
        let mut current = self.node(start).await?;
        for segment in path {
            current = self.find_child(&current.id, segment).await?;
        }
        Ok(current)
    }

    /// Variable children of a node.
    async fn variables_of(&self, node: &NodeId) -> Result<Vec<Node>> {
        self.browse(node, BrowseDirection::Forward, None, Some(NodeClass::Variable)).await
    }

    /// Method children of a node.
    async fn methods_of(&self, node: &NodeId) -> Result<Vec<Node>> {
        self.browse(node, BrowseDirection::Forward, None, Some(NodeClass::Method)).await
    }

    /// Current Value attribute.
    async fn read_value(&self, node: &NodeId) -> Result<Value> {
        self.get_attribute(node, AttributeId::Value).await
    }

    /// Writes the Value attribute.
    async fn write_value(&self, node: &NodeId, value: Value) -> Result<()> {
        self.set_attribute(node, AttributeId::Value, value).await
    }
}
