//! # sensorspace — Simulated Sensor-Network Address Space
//!
//! An industrial sensor network in miniature: typed node spaces, bounded
//! historization, subscriptions, calibration and cross-node aggregation.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `NodeSpace` is the contract between consumers and a space
//! 2. **One surface, two spaces**: the in-memory space and a remote peer answer the same calls
//! 3. **Typed attributes**: every `Value` write is checked against the node's declared type
//! 4. **Loops are handles**: periodic work is spawned, observed and stopped through `LoopHandle`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sensorspace::{sensor, AddressSpace, SensorLoopConfig};
//!
//! # async fn example() -> sensorspace::Result<()> {
//! // One in-memory space, pre-seeded with the standard folders.
//! let space = Arc::new(AddressSpace::new());
//!
//! // Sensor type hierarchy, one TemperatureSensor instance, calibration.
//! let model = sensor::build_sensor_model(&space).await?;
//!
//! // Produce a random reading every half second.
//! let handle =
//!     sensor::spawn_sensor_loop(Arc::clone(&space), &model, SensorLoopConfig::default());
//!
//! println!("{}", sensor::current_reading(&*space, &model.sensor).await?);
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Spaces
//!
//! | Space | Module | Description |
//! |-------|--------|-------------|
//! | `AddressSpace` | `space::memory` | In-memory space for one node process |
//! | `RemoteSpace` | `space::remote` | A peer's space through the session layer |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod space;
pub mod history;
pub mod calibration;
pub mod subscription;
pub mod sensor;
pub mod aggregate;
pub mod export;

use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Re-exports: Model (the node vocabulary)
// ============================================================================

pub use model::{
    Argument, AttributeId, AttributeSet, BrowseDirection, DataType, Identifier, ModellingRule,
    Node, NodeClass, NodeId, QualifiedName, Reference, ReferenceType, Value,
};

// ============================================================================
// Re-exports: Spaces
// ============================================================================

pub use space::{AddressSpace, MethodHandler, NodeSpace, RemoteSpace, SessionHub};

// ============================================================================
// Re-exports: History & calibration
// ============================================================================

pub use calibration::{calibrate, CalibrationParams};
pub use history::{HistorySample, HistoryStore, DEFAULT_HISTORY_CAPACITY};

// ============================================================================
// Re-exports: Subscriptions
// ============================================================================

pub use subscription::{
    Event, MonitorHandle, MonitoredItemId, MonitoredSet, Subscription, SubscriptionHandler,
    SubscriptionId, SubscriptionState, TraceHandler,
};

// ============================================================================
// Re-exports: Sensor & aggregation
// ============================================================================

pub use aggregate::{AggregationConfig, AggregationLoop, MonitorModel};
pub use sensor::{SensorLoopConfig, SensorModel};

// ============================================================================
// Loop handles
// ============================================================================

/// Handle to a spawned periodic loop (sensor production or aggregation).
///
/// Dropping the handle detaches the loop. [`stop`](LoopHandle::stop) ends it
/// after the in-flight tick completes; there is no mid-tick abort.
pub struct LoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn new(stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { stop, task }
    }

    /// Whether the loop already ran to completion.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop after its current tick and waits for it to wind down.
    pub async fn stop(self) {
        // The receiver is gone only if the task already exited.
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Node {node} has no attribute {attribute}")]
    UnknownAttribute { node: NodeId, attribute: AttributeId },

    #[error("Browse name {name} already taken under {parent}")]
    DuplicateBrowseName { parent: NodeId, name: QualifiedName },

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Argument mismatch: {0}")]
    ArgumentMismatch(String),

    #[error("Cannot instantiate abstract type {0}")]
    AbstractTypeInstantiation(NodeId),

    #[error("Subscription {0} is terminated")]
    SubscriptionClosed(SubscriptionId),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Empty history: {0}")]
    EmptyHistory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
