//! In-memory address space.
//!
//! This is the reference implementation of `NodeSpace`. Nodes, references,
//! method handlers and history buffers live in plain maps behind one RwLock.
//!
//! ## Locking
//!
//! One combined lock covers the whole space: a Value write, its history
//! append and the notification enqueue commit as a unit, so subscribers see
//! changes in mutation order and history never disagrees with the value a
//! notification carried. Method handlers run *without* the lock and may call
//! back into the space.
//!
//! ## Limitations
//!
//! - **No persistence**: the space lives and dies with the process.
//! - **No node deletion**: models are built once and live for the life of
//!   the space.
//! - **No access enforcement**: AccessLevel attributes are descriptive only;
//!   writes are not rejected by access mask.
//!
//! Use this space for:
//! - Hosting a simulated sensor network inside one process
//! - Serving peers through the session layer (`space::remote`)
//! - Testing model-building code without any transport

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::history::{HistorySample, HistoryStore};
use crate::model::*;
use crate::subscription::{Event, Subscription, SubscriptionEngine, SubscriptionHandler};
use crate::{Error, Result};
use super::{MethodHandler, NodeSpace};

/// Namespace index used for application nodes; namespace 0 is the base
/// layout seeded into every space.
pub const APPLICATION_NAMESPACE: u16 = 2;

// ============================================================================
// AddressSpace
// ============================================================================

/// In-memory typed node space.
pub struct AddressSpace {
    namespace: u16,
    state: RwLock<SpaceState>,
    subscriptions: SubscriptionEngine,
    next_id: AtomicU32,
}

#[derive(Default)]
struct SpaceState {
    nodes: HashMap<NodeId, Node>,
    /// Every edge is stored twice: Forward on the source, Inverse on the
    /// target. Vectors keep insertion order, which browse preserves.
    references: HashMap<NodeId, SmallVec<[Reference; 4]>>,
    methods: HashMap<NodeId, MethodEntry>,
    history: HistoryStore,
}

#[derive(Clone)]
struct MethodEntry {
    inputs: SmallVec<[Argument; 4]>,
    output: Argument,
    handler: MethodHandler,
}

/// Reference type used to attach a new child, derived from its class.
fn hierarchy_reference(class: NodeClass) -> ReferenceType {
    match class {
        NodeClass::Property => ReferenceType::HasProperty,
        NodeClass::Variable | NodeClass::Method => ReferenceType::HasComponent,
        NodeClass::Object | NodeClass::ObjectType => ReferenceType::Organizes,
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::with_namespace(APPLICATION_NAMESPACE)
    }

    pub fn with_namespace(namespace: u16) -> Self {
        let mut state = SpaceState::default();
        seed_base_layout(&mut state);
        Self {
            namespace,
            state: RwLock::new(state),
            subscriptions: SubscriptionEngine::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Namespace index new nodes are allocated in.
    pub fn namespace(&self) -> u16 {
        self.namespace
    }

    fn allocate_id(&self) -> NodeId {
        NodeId::numeric(self.namespace, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Model building
    // ========================================================================

    /// Creates a node under `parent`, attached by the reference type its
    /// class implies: Organizes for objects and object types, HasComponent
    /// for variables and methods, HasProperty for properties.
    pub fn create_node(
        &self,
        parent: &NodeId,
        class: NodeClass,
        browse_name: impl Into<QualifiedName>,
        attributes: AttributeSet,
    ) -> Result<NodeId> {
        let browse_name = browse_name.into();
        let state = &mut *self.state.write();
        state.ensure_exists(parent)?;
        state.check_browse_name_free(parent, &browse_name)?;
        let id = self.allocate_id();
        state.insert(Node::new(id.clone(), class, browse_name).with_attributes(attributes));
        state.link(parent.clone(), hierarchy_reference(class), id.clone());
        Ok(id)
    }

    /// Creates an object type. Under another object type the new type is
    /// attached as a subtype; anywhere else it is merely organized.
    pub fn create_object_type(
        &self,
        parent: &NodeId,
        browse_name: impl Into<QualifiedName>,
    ) -> Result<NodeId> {
        let browse_name = browse_name.into();
        let state = &mut *self.state.write();
        let parent_node = state
            .nodes
            .get(parent)
            .ok_or_else(|| Error::NotFound(format!("node {parent}")))?;
        let reference = if parent_node.class == NodeClass::ObjectType {
            ReferenceType::HasSubtype
        } else {
            ReferenceType::Organizes
        };
        state.check_browse_name_free(parent, &browse_name)?;
        let id = self.allocate_id();
        state.insert(
            Node::new(id.clone(), NodeClass::ObjectType, browse_name)
                .with_attributes(AttributeSet::object_type(false)),
        );
        state.link(parent.clone(), reference, id.clone());
        Ok(id)
    }

    /// Adds an explicit reference between two existing nodes.
    pub fn add_reference(
        &self,
        source: &NodeId,
        reference: ReferenceType,
        target: &NodeId,
    ) -> Result<()> {
        let state = &mut *self.state.write();
        state.ensure_exists(source)?;
        state.ensure_exists(target)?;
        state.link(source.clone(), reference, target.clone());
        Ok(())
    }

    /// Marks a type child as Mandatory or Optional for instantiation.
    pub fn set_modelling_rule(&self, node: &NodeId, rule: ModellingRule) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| Error::NotFound(format!("node {node}")))?;
        entry.modelling_rule = Some(rule);
        Ok(())
    }

    /// Creates a Method node under `owner` and registers its signature and
    /// handler. Instances of a type share the handler with the type's
    /// method node.
    pub fn register_method(
        &self,
        owner: &NodeId,
        browse_name: impl Into<QualifiedName>,
        inputs: Vec<Argument>,
        output: Argument,
        handler: MethodHandler,
    ) -> Result<NodeId> {
        let browse_name = browse_name.into();
        let state = &mut *self.state.write();
        state.ensure_exists(owner)?;
        state.check_browse_name_free(owner, &browse_name)?;
        let id = self.allocate_id();
        state.insert(Node::new(id.clone(), NodeClass::Method, browse_name));
        state.link(owner.clone(), ReferenceType::HasComponent, id.clone());
        state
            .methods
            .insert(id.clone(), MethodEntry { inputs: SmallVec::from(inputs), output, handler });
        Ok(id)
    }

    /// Creates an instance of a concrete object type under `parent`.
    ///
    /// The supertype chain is walked root-first and every Mandatory child is
    /// deep-copied onto the instance with a fresh id, modelling-rule flags
    /// preserved. Copied Method nodes share the type's handler. The instance
    /// points back at the type with a HasTypeDefinition reference.
    pub fn instantiate(
        &self,
        object_type: &NodeId,
        parent: &NodeId,
        browse_name: impl Into<QualifiedName>,
    ) -> Result<NodeId> {
        let browse_name = browse_name.into();
        let state = &mut *self.state.write();

        let ty = state
            .nodes
            .get(object_type)
            .ok_or_else(|| Error::NotFound(format!("object type {object_type}")))?;
        if ty.class != NodeClass::ObjectType {
            return Err(Error::TypeMismatch {
                expected: "ObjectType".into(),
                got: ty.class.to_string(),
            });
        }
        if ty.is_abstract() {
            return Err(Error::AbstractTypeInstantiation(object_type.clone()));
        }
        state.ensure_exists(parent)?;
        state.check_browse_name_free(parent, &browse_name)?;

        // Supertype chain, base first, so inherited children come before the
        // type's own.
        let mut chain = vec![object_type.clone()];
        let mut current = object_type.clone();
        while let Some(supertype) = state.supertype_of(&current) {
            chain.push(supertype.clone());
            current = supertype;
        }
        chain.reverse();

        let id = self.allocate_id();
        state.insert(
            Node::new(id.clone(), NodeClass::Object, browse_name)
                .with_attributes(AttributeSet::object()),
        );
        state.link(parent.clone(), ReferenceType::Organizes, id.clone());
        state.link(id.clone(), ReferenceType::HasTypeDefinition, object_type.clone());

        for ancestor in &chain {
            self.copy_mandatory_children(state, ancestor, &id);
        }

        Ok(id)
    }

    fn copy_mandatory_children(&self, state: &mut SpaceState, source: &NodeId, target: &NodeId) {
        let children: Vec<(ReferenceType, NodeId)> = state
            .references
            .get(source)
            .map(|refs| {
                refs.iter()
                    .filter(|r| {
                        r.direction == BrowseDirection::Forward && r.ty.is_hierarchical()
                    })
                    .map(|r| (r.ty, r.target.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (reference, child_id) in children {
            let Some(child) = state.nodes.get(&child_id) else { continue };
            if child.modelling_rule != Some(ModellingRule::Mandatory) {
                continue;
            }
            // An earlier type in the chain already contributed this name.
            if state.child_named(target, &child.browse_name).is_some() {
                continue;
            }
            let copy_id = self.allocate_id();
            let copy = Node { id: copy_id.clone(), ..child.clone() };
            if child.class == NodeClass::Method {
                if let Some(entry) = state.methods.get(&child_id).cloned() {
                    state.methods.insert(copy_id.clone(), entry);
                }
            }
            state.insert(copy);
            state.link(target.clone(), reference, copy_id.clone());
            self.copy_mandatory_children(state, &child_id, &copy_id);
        }
    }

    // ========================================================================
    // History and events
    // ========================================================================

    /// Starts historizing a variable's Value writes, keeping at most
    /// `capacity` samples. Also raises the node's Historizing attribute so
    /// discovery sees it.
    pub fn enable_history(&self, node: &NodeId, capacity: usize) -> Result<()> {
        let state = &mut *self.state.write();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| Error::NotFound(format!("node {node}")))?;
        if entry.class != NodeClass::Variable {
            return Err(Error::TypeMismatch {
                expected: "Variable".into(),
                got: entry.class.to_string(),
            });
        }
        entry.attributes.insert(AttributeId::Historizing, true);
        state.history.enable(node.clone(), capacity);
        Ok(())
    }

    /// Marks `source` as an event notifier generating events of
    /// `event_type` (usually [`NodeId::BASE_EVENT_TYPE`]).
    pub fn add_event_source(&self, source: &NodeId, event_type: &NodeId) -> Result<()> {
        let state = &mut *self.state.write();
        state.ensure_exists(event_type)?;
        let entry = state
            .nodes
            .get_mut(source)
            .ok_or_else(|| Error::NotFound(format!("node {source}")))?;
        entry.attributes.insert(AttributeId::EventNotifier, true);
        state.link(source.clone(), ReferenceType::GeneratesEvent, event_type.clone());
        Ok(())
    }

    /// Publishes an event from `source` to every matching subscription.
    pub fn trigger_event(&self, source: &NodeId, message: impl Into<String>) -> Result<()> {
        let state = self.state.read();
        state.ensure_exists(source)?;
        let event = Event { source: source.clone(), message: message.into(), time: Utc::now() };
        self.subscriptions.publish_event(&event);
        Ok(())
    }

    /// Creates a subscription delivering in batches every `period`.
    /// Must be called within a Tokio runtime.
    pub fn create_subscription(
        &self,
        period: Duration,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Subscription {
        self.subscriptions.create(period, handler)
    }

    // ========================================================================
    // Whole-space accessors (export, diagnostics)
    // ========================================================================

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Number of edges (each counted once, from its source side).
    pub fn reference_count(&self) -> usize {
        self.state
            .read()
            .references
            .values()
            .flatten()
            .filter(|r| r.direction == BrowseDirection::Forward)
            .count()
    }

    /// Snapshot of every node. Unordered.
    pub fn all_nodes(&self) -> Vec<Node> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Outgoing references of one node, in insertion order.
    pub fn forward_references(&self, node: &NodeId) -> Result<Vec<Reference>> {
        let state = self.state.read();
        state.ensure_exists(node)?;
        Ok(state
            .references
            .get(node)
            .map(|refs| {
                refs.iter()
                    .filter(|r| r.direction == BrowseDirection::Forward)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn seed_base_layout(state: &mut SpaceState) {
    let object = |id: NodeId, name: &str| {
        Node::new(id, NodeClass::Object, QualifiedName::new(0, name))
            .with_attributes(AttributeSet::object())
    };
    state.insert(object(NodeId::ROOT_FOLDER, "Root"));
    state.insert(object(NodeId::OBJECTS_FOLDER, "Objects"));
    state.insert(object(NodeId::TYPES_FOLDER, "Types"));
    state.insert(object(NodeId::OBJECT_TYPES_FOLDER, "ObjectTypes"));
    state.insert(object(NodeId::SERVER, "Server"));
    state.insert(
        Node::new(NodeId::BASE_EVENT_TYPE, NodeClass::ObjectType, QualifiedName::new(0, "BaseEventType"))
            .with_attributes(AttributeSet::object_type(false)),
    );

    state.link(NodeId::ROOT_FOLDER, ReferenceType::Organizes, NodeId::OBJECTS_FOLDER);
    state.link(NodeId::ROOT_FOLDER, ReferenceType::Organizes, NodeId::TYPES_FOLDER);
    state.link(NodeId::TYPES_FOLDER, ReferenceType::Organizes, NodeId::OBJECT_TYPES_FOLDER);
    state.link(NodeId::TYPES_FOLDER, ReferenceType::Organizes, NodeId::BASE_EVENT_TYPE);
    state.link(NodeId::OBJECTS_FOLDER, ReferenceType::Organizes, NodeId::SERVER);
}

impl SpaceState {
    fn ensure_exists(&self, node: &NodeId) -> Result<()> {
        if self.nodes.contains_key(node) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("node {node}")))
        }
    }

    fn insert(&mut self, node: Node) {
        self.references.entry(node.id.clone()).or_default();
        self.nodes.insert(node.id.clone(), node);
    }

    fn link(&mut self, source: NodeId, ty: ReferenceType, target: NodeId) {
        self.references
            .entry(source.clone())
            .or_default()
            .push(Reference::forward(ty, target.clone()));
        self.references.entry(target).or_default().push(Reference::inverse(ty, source));
    }

    /// Containment child (hierarchical or subtype edge) carrying this
    /// browse name, if any.
    fn child_named(&self, parent: &NodeId, name: &QualifiedName) -> Option<&Node> {
        let refs = self.references.get(parent)?;
        refs.iter()
            .filter(|r| {
                r.direction == BrowseDirection::Forward
                    && (r.ty.is_hierarchical() || r.ty == ReferenceType::HasSubtype)
            })
            .filter_map(|r| self.nodes.get(&r.target))
            .find(|n| &n.browse_name == name)
    }

    fn check_browse_name_free(&self, parent: &NodeId, name: &QualifiedName) -> Result<()> {
        match self.child_named(parent, name) {
            Some(_) => Err(Error::DuplicateBrowseName {
                parent: parent.clone(),
                name: name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn supertype_of(&self, ty: &NodeId) -> Option<NodeId> {
        self.references.get(ty)?.iter().find_map(|r| {
            (r.direction == BrowseDirection::Inverse && r.ty == ReferenceType::HasSubtype)
                .then(|| r.target.clone())
        })
    }
}

/// Validates a call against the declared signature. Optional arguments may
/// be omitted from the tail; omitted ones reach the handler as Null so
/// positions stay stable.
fn check_call(entry: &MethodEntry, mut args: Vec<Value>) -> Result<Vec<Value>> {
    if args.len() > entry.inputs.len() {
        return Err(Error::ArgumentMismatch(format!(
            "takes at most {} arguments, got {}",
            entry.inputs.len(),
            args.len(),
        )));
    }
    for (position, (value, declared)) in args.iter().zip(&entry.inputs).enumerate() {
        if !declared.accepts(value) {
            return Err(Error::ArgumentMismatch(format!(
                "argument {position} ({}) expects {}, got {}",
                declared.name,
                declared.data_type,
                value.type_name(),
            )));
        }
    }
    for declared in &entry.inputs[args.len()..] {
        if !declared.optional {
            return Err(Error::ArgumentMismatch(format!(
                "missing required argument {}",
                declared.name,
            )));
        }
    }
    args.resize(entry.inputs.len(), Value::Null);
    Ok(args)
}

// ============================================================================
// NodeSpace impl
// ============================================================================

#[async_trait]
impl NodeSpace for AddressSpace {
    async fn browse(
        &self,
        node: &NodeId,
        direction: BrowseDirection,
        reference: Option<ReferenceType>,
        class: Option<NodeClass>,
    ) -> Result<Vec<Node>> {
        let state = self.state.read();
        state.ensure_exists(node)?;
        let Some(refs) = state.references.get(node) else {
            return Ok(Vec::new());
        };
        let mut matches = Vec::new();
        for r in refs {
            if r.direction != direction {
                continue;
            }
            if reference.is_some_and(|ty| ty != r.ty) {
                continue;
            }
            let Some(target) = state.nodes.get(&r.target) else { continue };
            if class.is_some_and(|c| c != target.class) {
                continue;
            }
            matches.push(target.clone());
        }
        Ok(matches)
    }

    async fn node(&self, id: &NodeId) -> Result<Node> {
        self.state
            .read()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    async fn get_attribute(&self, node: &NodeId, attribute: AttributeId) -> Result<Value> {
        let state = self.state.read();
        let entry = state
            .nodes
            .get(node)
            .ok_or_else(|| Error::NotFound(format!("node {node}")))?;
        entry
            .attributes
            .get(attribute)
            .cloned()
            .ok_or(Error::UnknownAttribute { node: node.clone(), attribute })
    }

    async fn set_attribute(
        &self,
        node: &NodeId,
        attribute: AttributeId,
        value: Value,
    ) -> Result<()> {
        let state = &mut *self.state.write();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| Error::NotFound(format!("node {node}")))?;
        if !entry.attributes.contains(attribute) {
            return Err(Error::UnknownAttribute { node: node.clone(), attribute });
        }
        match attribute {
            AttributeId::Value => {
                if !entry.attributes.conforms(&value) {
                    return Err(Error::TypeMismatch {
                        expected: entry
                            .attributes
                            .declared_type()
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "conforming value".into()),
                        got: value.type_name().into(),
                    });
                }
            }
            fixed => {
                if let Some(declared) = fixed.fixed_type() {
                    if !value.conforms_to(declared) {
                        return Err(Error::TypeMismatch {
                            expected: declared.to_string(),
                            got: value.type_name().into(),
                        });
                    }
                }
            }
        }
        entry.attributes.insert(attribute, value.clone());
        if attribute == AttributeId::Value {
            // Historize and notify while still holding the lock so delivery
            // order matches mutation order.
            state.history.record(node, value.clone(), Utc::now());
            self.subscriptions.publish_data_change(node, &value);
        }
        Ok(())
    }

    async fn invoke_method(
        &self,
        owner: &NodeId,
        method: &NodeId,
        args: Vec<Value>,
    ) -> Result<Value> {
        let entry = {
            let state = self.state.read();
            state.ensure_exists(owner)?;
            let attached = state.references.get(owner).is_some_and(|refs| {
                refs.iter()
                    .any(|r| r.direction == BrowseDirection::Forward && &r.target == method)
            });
            if !attached {
                return Err(Error::NotFound(format!("method {method} on {owner}")));
            }
            state
                .methods
                .get(method)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("method {method}")))?
        };
        let args = check_call(&entry, args)?;
        // Handler runs without the space lock so it may call back in.
        let result = (entry.handler)(&args)?;
        if !entry.output.accepts(&result) {
            return Err(Error::TypeMismatch {
                expected: entry.output.data_type.to_string(),
                got: result.type_name().into(),
            });
        }
        Ok(result)
    }

    async fn read_history(&self, node: &NodeId) -> Result<Vec<HistorySample>> {
        let state = self.state.read();
        state.ensure_exists(node)?;
        Ok(state.history.read(node))
    }
}

// ============================================================================
// Tests
// ============================================================================
