//! Session layer between address spaces.
//!
//! A [`SessionHub`] binds local spaces to addresses; [`RemoteSpace`] is the
//! connected client side and implements [`NodeSpace`], so discovery, query
//! helpers and the aggregation loop run unchanged against a peer.
//!
//! Each binding is served by one task. Requests travel as messages with a
//! oneshot reply; every transport failure — nothing bound, binding torn
//! down, reply timeout — surfaces as [`Error::RemoteUnavailable`], which
//! periodic callers treat as retryable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::history::HistorySample;
use crate::model::{AttributeId, BrowseDirection, Node, NodeClass, NodeId, ReferenceType, Value};
use crate::{Error, Result};
use super::{AddressSpace, NodeSpace};

/// How long a client waits for a reply before giving the tick up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

enum Request {
    Browse {
        node: NodeId,
        direction: BrowseDirection,
        reference: Option<ReferenceType>,
        class: Option<NodeClass>,
    },
    Node {
        id: NodeId,
    },
    GetAttribute {
        node: NodeId,
        attribute: AttributeId,
    },
    SetAttribute {
        node: NodeId,
        attribute: AttributeId,
        value: Value,
    },
    InvokeMethod {
        owner: NodeId,
        method: NodeId,
        args: Vec<Value>,
    },
    ReadHistory {
        node: NodeId,
    },
}

enum Response {
    Nodes(Vec<Node>),
    Node(Node),
    Value(Value),
    History(Vec<HistorySample>),
    Done,
}

type SessionRequest = (Request, oneshot::Sender<Result<Response>>);

// ============================================================================
// SessionHub
// ============================================================================

/// In-process registry of bound address spaces.
#[derive(Default)]
pub struct SessionHub {
    bindings: RwLock<HashMap<String, Binding>>,
}

struct Binding {
    requests: mpsc::Sender<SessionRequest>,
    stop: watch::Sender<bool>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a space to an address and spawns its server task. Rebinding an
    /// address stops the previous server.
    pub fn bind(&self, address: impl Into<String>, space: Arc<AddressSpace>) {
        let address = address.into();
        let (requests, rx) = mpsc::channel(32);
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(serve(address.clone(), space, rx, stop_rx));

        let previous = self.bindings.write().insert(address.clone(), Binding { requests, stop });
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
        }
        info!(%address, "address space bound");
    }

    /// Connects to a bound address. Fails fast when nothing is bound there;
    /// failures after connect are per-request and retryable.
    pub fn connect(&self, address: &str) -> Result<RemoteSpace> {
        let bindings = self.bindings.read();
        let binding = bindings
            .get(address)
            .ok_or_else(|| Error::RemoteUnavailable(format!("nothing bound at {address}")))?;
        info!(%address, "session established");
        Ok(RemoteSpace {
            address: address.to_owned(),
            requests: binding.requests.clone(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Tears a binding down. Connected clients start failing with
    /// [`Error::RemoteUnavailable`] once the server task drains.
    pub fn unbind(&self, address: &str) {
        if let Some(binding) = self.bindings.write().remove(address) {
            let _ = binding.stop.send(true);
            info!(%address, "address space unbound");
        }
    }
}

async fn serve(
    address: String,
    space: Arc<AddressSpace>,
    mut rx: mpsc::Receiver<SessionRequest>,
    mut stop: watch::Receiver<bool>,
) {
    info!(%address, "session server started");
    loop {
        tokio::select! {
            // Teardown wins over queued requests.
            biased;
            _ = stop.changed() => break,
            request = rx.recv() => match request {
                Some((request, reply)) => {
                    let _ = reply.send(handle(&space, request).await);
                }
                None => break,
            },
        }
    }
    info!(%address, "session server stopped");
}

async fn handle(space: &AddressSpace, request: Request) -> Result<Response> {
    match request {
        Request::Browse { node, direction, reference, class } => {
            space.browse(&node, direction, reference, class).await.map(Response::Nodes)
        }
        Request::Node { id } => space.node(&id).await.map(Response::Node),
        Request::GetAttribute { node, attribute } => {
            space.get_attribute(&node, attribute).await.map(Response::Value)
        }
        Request::SetAttribute { node, attribute, value } => {
            space.set_attribute(&node, attribute, value).await.map(|_| Response::Done)
        }
        Request::InvokeMethod { owner, method, args } => {
            space.invoke_method(&owner, &method, args).await.map(Response::Value)
        }
        Request::ReadHistory { node } => {
            space.read_history(&node).await.map(Response::History)
        }
    }
}

// ============================================================================
// RemoteSpace
// ============================================================================

/// Client handle on a peer's address space.
#[derive(Clone, Debug)]
pub struct RemoteSpace {
    address: String,
    requests: mpsc::Sender<SessionRequest>,
    timeout: Duration,
}

impl RemoteSpace {
    /// Address this session was connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests.send((request, reply_tx)).await.map_err(|_| {
            Error::RemoteUnavailable(format!("session to {} is closed", self.address))
        })?;
        match timeout(self.timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(Error::RemoteUnavailable(format!(
                "session to {} dropped the request",
                self.address,
            ))),
            Err(_) => {
                warn!(address = %self.address, "request timed out");
                Err(Error::RemoteUnavailable(format!(
                    "request to {} timed out",
                    self.address,
                )))
            }
        }
    }

    fn malformed(&self) -> Error {
        Error::RemoteUnavailable(format!("malformed response from {}", self.address))
    }
}

#[async_trait]
impl NodeSpace for RemoteSpace {
    async fn browse(
        &self,
        node: &NodeId,
        direction: BrowseDirection,
        reference: Option<ReferenceType>,
        class: Option<NodeClass>,
    ) -> Result<Vec<Node>> {
        let request =
            Request::Browse { node: node.clone(), direction, reference, class };
        match self.call(request).await? {
            Response::Nodes(nodes) => Ok(nodes),
            _ => Err(self.malformed()),
        }
    }

    async fn node(&self, id: &NodeId) -> Result<Node> {
        match self.call(Request::Node { id: id.clone() }).await? {
            Response::Node(node) => Ok(node),
            _ => Err(self.malformed()),
        }
    }

    async fn get_attribute(&self, node: &NodeId, attribute: AttributeId) -> Result<Value> {
        match self.call(Request::GetAttribute { node: node.clone(), attribute }).await? {
            Response::Value(value) => Ok(value),
            _ => Err(self.malformed()),
        }
    }

    async fn set_attribute(
        &self,
        node: &NodeId,
        attribute: AttributeId,
        value: Value,
    ) -> Result<()> {
        match self.call(Request::SetAttribute { node: node.clone(), attribute, value }).await? {
            Response::Done => Ok(()),
            _ => Err(self.malformed()),
        }
    }

    async fn invoke_method(
        &self,
        owner: &NodeId,
        method: &NodeId,
        args: Vec<Value>,
    ) -> Result<Value> {
        let request =
            Request::InvokeMethod { owner: owner.clone(), method: method.clone(), args };
        match self.call(request).await? {
            Response::Value(value) => Ok(value),
            _ => Err(self.malformed()),
        }
    }

    async fn read_history(&self, node: &NodeId) -> Result<Vec<HistorySample>> {
        match self.call(Request::ReadHistory { node: node.clone() }).await? {
            Response::History(samples) => Ok(samples),
            _ => Err(self.malformed()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
