//! Simulated temperature sensor: type hierarchy, instance, calibration
//! method and the periodic production loop.
//!
//! The model mirrors a small industrial setup: an abstract `BaseSensorType`
//! declares what every sensor carries (model information, a historized
//! value), a concrete `TemperatureSensorType` adds the engineering unit, and
//! one instance lives under the Objects folder producing a random reading
//! every half second.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::calibration::{calibrate, CalibrationParams};
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::model::{
    Argument, AttributeId, AttributeSet, BrowseDirection, DataType, ModellingRule, NodeClass,
    NodeId, QualifiedName, Value,
};
use crate::space::{AddressSpace, NodeSpace};
use crate::{Error, LoopHandle, Result};

/// Model designation reported by the simulated sensor.
pub const SENSOR_MODEL_INFO: &str = "SMTIR 9901";

/// Unit reported by the temperature sensor type.
pub const TEMPERATURE_UNIT: &str = "°C";

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Node ids of the built sensor model.
#[derive(Debug, Clone)]
pub struct SensorModel {
    pub base_type: NodeId,
    pub temperature_type: NodeId,
    /// The instance under the Objects folder.
    pub sensor: NodeId,
    pub model_information: NodeId,
    pub sensor_value: NodeId,
    pub engineering_unit: NodeId,
    /// Calibration method, registered on the Objects folder.
    pub calibration_method: NodeId,
}

// ============================================================================
// Model building
// ============================================================================

/// Builds the sensor type hierarchy and one `TemperatureSensor` instance.
///
/// The instance and the Server node are marked as event sources, and the
/// instance's `SensorValue` is historized with the default capacity.
pub async fn build_sensor_model(space: &AddressSpace) -> Result<SensorModel> {
    let ns = space.namespace();
    let qn = |name: &str| QualifiedName::new(ns, name);

    // Abstract base: model information and a historized value, both
    // mandatory on every sensor.
    let base_type = space.create_object_type(&NodeId::OBJECT_TYPES_FOLDER, qn("BaseSensorType"))?;
    space.set_attribute(&base_type, AttributeId::IsAbstract, Value::Bool(true)).await?;

    let model_information_decl = space.create_node(
        &base_type,
        NodeClass::Variable,
        qn("SensorModelInformation"),
        AttributeSet::variable(DataType::String, ""),
    )?;
    space.set_modelling_rule(&model_information_decl, ModellingRule::Mandatory)?;

    let sensor_value_decl = space.create_node(
        &base_type,
        NodeClass::Variable,
        qn("SensorValue"),
        AttributeSet::variable(DataType::Float, 0.0).with(AttributeId::Historizing, true),
    )?;
    space.set_modelling_rule(&sensor_value_decl, ModellingRule::Mandatory)?;

    // Concrete subtype contributes the unit.
    let temperature_type = space.create_object_type(&base_type, qn("TemperatureSensorType"))?;
    let unit_decl = space.create_node(
        &temperature_type,
        NodeClass::Property,
        qn("EngineeringUnit"),
        AttributeSet::property(DataType::String, TEMPERATURE_UNIT),
    )?;
    space.set_modelling_rule(&unit_decl, ModellingRule::Mandatory)?;

    // The one simulated instance.
    let sensor = space.instantiate(&temperature_type, &NodeId::OBJECTS_FOLDER, qn("TemperatureSensor"))?;
    let model_information = space.find_child(&sensor, &qn("SensorModelInformation")).await?.id;
    let sensor_value = space.find_child(&sensor, &qn("SensorValue")).await?.id;
    let engineering_unit = space.find_child(&sensor, &qn("EngineeringUnit")).await?.id;

    space.write_value(&model_information, Value::from(SENSOR_MODEL_INFO)).await?;
    space.enable_history(&sensor_value, DEFAULT_HISTORY_CAPACITY)?;
    space.add_event_source(&sensor, &NodeId::BASE_EVENT_TYPE)?;
    space.add_event_source(&NodeId::SERVER, &NodeId::BASE_EVENT_TYPE)?;

    let calibration_method = register_calibration_method(space, &NodeId::OBJECTS_FOLDER)?;

    info!(sensor = %sensor, "temperature sensor model built");
    Ok(SensorModel {
        base_type,
        temperature_type,
        sensor,
        model_information,
        sensor_value,
        engineering_unit,
        calibration_method,
    })
}

/// Registers the linear calibration method on `owner`.
///
/// `Calibration(val, m?, c?) -> m * val + c`. The parameters are per-call:
/// omitting them means identity for that call, never "whatever the last
/// caller set".
pub fn register_calibration_method(space: &AddressSpace, owner: &NodeId) -> Result<NodeId> {
    space.register_method(
        owner,
        QualifiedName::new(space.namespace(), "Calibration"),
        vec![
            Argument::scalar("val", DataType::Float),
            Argument::scalar("m", DataType::Float).optional(),
            Argument::scalar("c", DataType::Float).optional(),
        ],
        Argument::scalar("calibrated", DataType::Float),
        Arc::new(|args| {
            let raw = args
                .first()
                .and_then(Value::as_float)
                .ok_or_else(|| Error::ArgumentMismatch("val must be numeric".into()))?;
            let params = match args.get(1).and_then(Value::as_float) {
                Some(slope) => CalibrationParams::new(
                    slope,
                    args.get(2).and_then(Value::as_float).unwrap_or(0.0),
                ),
                None => CalibrationParams::default(),
            };
            Ok(Value::Float(calibrate(raw, &params)))
        }),
    )
}

// ============================================================================
// Production loop
// ============================================================================

#[derive(Debug, Clone)]
pub struct SensorLoopConfig {
    pub sample_interval: Duration,
    /// Inclusive bounds of the simulated reading.
    pub min: i64,
    pub max: i64,
}

impl Default for SensorLoopConfig {
    fn default() -> Self {
        Self { sample_interval: DEFAULT_SAMPLE_INTERVAL, min: 20, max: 50 }
    }
}

/// Spawns the production loop: every interval it writes a random reading to
/// the sensor value (which historizes and notifies) and raises a
/// "Temperature Change" event from the sensor.
pub fn spawn_sensor_loop(
    space: Arc<AddressSpace>,
    model: &SensorModel,
    config: SensorLoopConfig,
) -> LoopHandle {
    let sensor = model.sensor.clone();
    let value = model.sensor_value.clone();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        debug!("sensor loop started");
        // Sleep-then-act: the first sample lands one interval after spawn.
        let interval = config.sample_interval;
        let mut tick = time::interval_at(Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                // Stop is honored between ticks, never mid-sample.
                biased;
                _ = stop_rx.changed() => break,
                _ = tick.tick() => {
                    let reading = rand::thread_rng().gen_range(config.min..=config.max);
                    if let Err(error) = produce(&space, &value, &sensor, reading).await {
                        warn!(%error, "sensor tick failed");
                    }
                }
            }
        }
        debug!("sensor loop stopped");
    });
    LoopHandle::new(stop_tx, task)
}

async fn produce(
    space: &AddressSpace,
    value: &NodeId,
    sensor: &NodeId,
    reading: i64,
) -> Result<()> {
    space.write_value(value, Value::Int(reading)).await?;
    space.trigger_event(sensor, "Temperature Change")?;
    debug!(reading, "sensor sample produced");
    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

/// Model designation of a sensor, read from its `…Model…` variable.
/// Works against local and remote spaces alike.
pub async fn model_information<S: NodeSpace + ?Sized>(
    space: &S,
    sensor: &NodeId,
) -> Result<Option<String>> {
    for child in space.variables_of(sensor).await? {
        if child.browse_name.name.contains("Model") {
            let value = space.read_value(&child.id).await?;
            return Ok(value.as_str().map(str::to_owned));
        }
    }
    Ok(None)
}

/// Current reading formatted with its unit, e.g. `23°C`.
pub async fn current_reading<S: NodeSpace + ?Sized>(
    space: &S,
    sensor: &NodeId,
) -> Result<String> {
    let mut value = None;
    let mut unit = String::new();
    for child in space.browse(sensor, BrowseDirection::Forward, None, None).await? {
        if child.browse_name.name.contains("Value") {
            value = Some(space.read_value(&child.id).await?);
        } else if child.browse_name.name.contains("Unit") {
            if let Some(u) = space.read_value(&child.id).await?.as_str() {
                unit = u.to_owned();
            }
        }
    }
    match value {
        Some(value) => Ok(format!("{value}{unit}")),
        None => Ok("No Value".into()),
    }
}

// ============================================================================
// Tests
// ============================================================================
