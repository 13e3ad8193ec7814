//! # Address Space Model
//!
//! Clean DTOs that define the typed node address space.
//! These types cross every boundary: space ↔ session ↔ loops ↔ user.
//!
//! Design rule: this module is pure data — no locks, no I/O, no async.

pub mod attribute;
pub mod method;
pub mod node;
pub mod reference;
pub mod value;

pub use attribute::{
    AttributeId, AttributeSet, ACCESS_CURRENT_READ, ACCESS_CURRENT_WRITE, RANK_ONE_DIMENSION,
    RANK_SCALAR,
};
pub use method::Argument;
pub use node::{Identifier, ModellingRule, Node, NodeClass, NodeId, QualifiedName};
pub use reference::{BrowseDirection, Reference, ReferenceType};
pub use value::{DataType, Value};
