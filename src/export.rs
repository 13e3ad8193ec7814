//! JSON export — serialize an address space as one deterministic document.
//!
//! Snapshots every node with its attributes and outgoing references so a
//! space can be diffed, dropped into a test fixture or inspected offline.
//!
//! ```text
//! AddressSpace → export_json() → serde_json::Value
//!   → write_json() pretty-prints it to any io::Write
//! ```

use std::io::Write;

use serde_json::{json, Map, Value as Json};

use crate::model::{Node, Value};
use crate::space::AddressSpace;
use crate::Result;

/// Snapshot of the whole space as one JSON document.
///
/// Nodes are ordered by id and attributes by name, so two spaces built the
/// same way export byte-identically.
pub fn export_json(space: &AddressSpace) -> Json {
    let mut nodes = space.all_nodes();
    nodes.sort_by_key(|node| node.id.to_string());

    let exported: Vec<Json> = nodes.iter().map(|node| export_node(space, node)).collect();
    json!({
        "node_count": space.node_count(),
        "reference_count": space.reference_count(),
        "nodes": exported,
    })
}

/// Pretty-prints [`export_json`] to `writer`, trailing newline included.
pub fn write_json(space: &AddressSpace, writer: &mut dyn Write) -> Result<()> {
    let document = export_json(space);
    serde_json::to_writer_pretty(&mut *writer, &document).map_err(std::io::Error::from)?;
    writeln!(writer)?;
    Ok(())
}

fn export_node(space: &AddressSpace, node: &Node) -> Json {
    let mut attributes: Vec<(String, Json)> = node
        .attributes
        .iter()
        .map(|(id, value)| (id.to_string(), export_value(value)))
        .collect();
    attributes.sort_by(|a, b| a.0.cmp(&b.0));
    let attributes: Map<String, Json> = attributes.into_iter().collect();

    // The node was just listed from this same space and nodes are never
    // removed, so the lookup cannot miss.
    let references: Vec<Json> = space
        .forward_references(&node.id)
        .unwrap_or_default()
        .iter()
        .map(|r| {
            json!({
                "reference_type": r.ty.to_string(),
                "target": r.target.to_string(),
            })
        })
        .collect();

    json!({
        "id": node.id.to_string(),
        "class": node.class.to_string(),
        "browse_name": node.browse_name.to_string(),
        "display_name": node.display_name(),
        "modelling_rule": node.modelling_rule,
        "attributes": attributes,
        "references": references,
    })
}

/// Attribute values as plain JSON, not the tagged enum encoding.
fn export_value(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::List(items) => Json::Array(items.iter().map(export_value).collect()),
    }
}
