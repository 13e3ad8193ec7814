//! Monitoring node: pulls a peer's calibrated sensor history and
//! republishes the moving average.
//!
//! This is the second half of the two-node setup. The first node (see
//! [`crate::sensor`]) produces readings; this one connects to it through a
//! [`RemoteSpace`], pulls the historized values through the peer's own
//! calibration method, and writes the rounded mean into its own
//! `MovingAverage` object. Both sides keep their storage to themselves: the
//! aggregating node never mutates the peer, only reads and invokes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationParams;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::model::{
    Argument, AttributeId, AttributeSet, DataType, Node, NodeClass, NodeId, QualifiedName, Value,
};
use crate::space::memory::APPLICATION_NAMESPACE;
use crate::space::{AddressSpace, NodeSpace, RemoteSpace};
use crate::{Error, LoopHandle, Result};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Node ids of the built monitoring model.
#[derive(Debug, Clone)]
pub struct MonitorModel {
    /// The `MovingAverage` object under the Objects folder.
    pub object: NodeId,
    /// Mirror of the remote sensor's unit.
    pub engineering_unit: NodeId,
    /// Historized variable the averages are written to.
    pub value: NodeId,
    /// Averaging method, registered on the Objects folder.
    pub average_method: NodeId,
}

// ============================================================================
// Model building
// ============================================================================

/// Builds the `MovingAverage` object with its unit property and historized
/// value variable, and registers the averaging method.
pub fn build_monitor_model(space: &AddressSpace) -> Result<MonitorModel> {
    let ns = space.namespace();

    let object = space.create_node(
        &NodeId::OBJECTS_FOLDER,
        NodeClass::Object,
        QualifiedName::new(ns, "MovingAverage"),
        AttributeSet::object().with(AttributeId::EventNotifier, true),
    )?;
    let engineering_unit = space.create_node(
        &object,
        NodeClass::Property,
        QualifiedName::new(ns, "EngineeringUnit"),
        AttributeSet::property(DataType::String, ""),
    )?;
    let value = space.create_node(
        &object,
        NodeClass::Variable,
        QualifiedName::new(ns, "ValueNode"),
        AttributeSet::variable(DataType::Float, 0.0),
    )?;
    space.enable_history(&value, DEFAULT_HISTORY_CAPACITY)?;

    let average_method = register_moving_average_method(space, &NodeId::OBJECTS_FOLDER)?;

    info!(object = %object, "moving average model built");
    Ok(MonitorModel { object, engineering_unit, value, average_method })
}

/// Registers the moving-average method on `owner`.
///
/// Takes a one-dimensional Float array and returns the arithmetic mean
/// rounded to three decimals. An empty array is [`Error::EmptyHistory`], not
/// a division by zero.
pub fn register_moving_average_method(space: &AddressSpace, owner: &NodeId) -> Result<NodeId> {
    space.register_method(
        owner,
        QualifiedName::new(space.namespace(), "Moving Temperature Average"),
        vec![Argument::array("temperatures", DataType::Float)],
        Argument::scalar("average", DataType::Float),
        Arc::new(|args| {
            let samples = args
                .first()
                .and_then(Value::as_list)
                .ok_or_else(|| Error::ArgumentMismatch("temperatures must be an array".into()))?;
            if samples.is_empty() {
                return Err(Error::EmptyHistory("no samples to average".into()));
            }
            let mut sum = 0.0;
            for sample in samples {
                sum += sample.as_float().ok_or_else(|| {
                    Error::ArgumentMismatch("temperatures must be numeric".into())
                })?;
            }
            Ok(Value::Float(round3(sum / samples.len() as f64)))
        }),
    )
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// ============================================================================
// History pull
// ============================================================================

/// Pulls a sensor's historized readings through the peer's calibration
/// method, newest first.
///
/// Every Variable child of `sensor` whose browse name contains `Value` is
/// read back; each raw sample makes one method round trip on `owner`. When
/// `calibration` is absent the method is called with the raw value alone and
/// applies its identity default.
pub async fn pull_calibrated_history<S: NodeSpace + ?Sized>(
    space: &S,
    sensor: &NodeId,
    owner: &NodeId,
    method: &NodeId,
    calibration: Option<CalibrationParams>,
) -> Result<Vec<f64>> {
    let mut history = Vec::new();
    for variable in space.variables_of(sensor).await? {
        if !variable.browse_name.name.contains("Value") {
            continue;
        }
        for sample in space.read_history(&variable.id).await? {
            let mut args = vec![sample.value];
            if let Some(params) = calibration {
                args.push(Value::Float(params.slope));
                args.push(Value::Float(params.intercept));
            }
            let calibrated = space.invoke_method(owner, method, args).await?;
            match calibrated.as_float() {
                Some(value) => history.push(value),
                None => {
                    return Err(Error::TypeMismatch {
                        expected: DataType::Float.to_string(),
                        got: calibrated.type_name().into(),
                    });
                }
            }
        }
    }
    Ok(history)
}

// ============================================================================
// Aggregation loop
// ============================================================================

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    pub tick_interval: Duration,
    /// Browse name the remote sensor is re-resolved by, every tick.
    pub sensor_name: QualifiedName,
    /// Browse name of the calibration method on the peer's Objects folder.
    pub method_name: QualifiedName,
    /// Calibration parameters sent along with every pull; `None` leaves the
    /// remote method at its identity default.
    pub calibration: Option<CalibrationParams>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            sensor_name: QualifiedName::new(APPLICATION_NAMESPACE, "TemperatureSensor"),
            method_name: QualifiedName::new(APPLICATION_NAMESPACE, "Calibration"),
            calibration: None,
        }
    }
}

/// Periodically pulls the peer's calibrated history and republishes the
/// moving average into the local space.
pub struct AggregationLoop {
    remote: RemoteSpace,
    local: Arc<AddressSpace>,
    model: MonitorModel,
    config: AggregationConfig,
}

impl AggregationLoop {
    pub fn new(
        remote: RemoteSpace,
        local: Arc<AddressSpace>,
        model: MonitorModel,
        config: AggregationConfig,
    ) -> Self {
        Self { remote, local, model, config }
    }

    /// One aggregation pass: resolve the remote sensor, mirror its unit,
    /// pull its calibrated history and republish the mean.
    ///
    /// Returns `Ok(None)` when the peer has no samples yet; nothing is
    /// written locally for that tick.
    pub async fn tick(&self) -> Result<Option<f64>> {
        // Resolved fresh every tick so a rebuilt peer model keeps working.
        let sensor =
            self.remote.find_child(&NodeId::OBJECTS_FOLDER, &self.config.sensor_name).await?;
        self.mirror_unit(&sensor.id).await?;
        let method = self.resolve_calibration().await?;

        let history = pull_calibrated_history(
            &self.remote,
            &sensor.id,
            &NodeId::OBJECTS_FOLDER,
            &method.id,
            self.config.calibration,
        )
        .await?;
        let samples: Vec<Value> = history.into_iter().map(Value::Float).collect();

        let outcome = self
            .local
            .invoke_method(
                &NodeId::OBJECTS_FOLDER,
                &self.model.average_method,
                vec![Value::List(samples)],
            )
            .await;
        let average = match outcome {
            Ok(value) => value.as_float().ok_or_else(|| Error::TypeMismatch {
                expected: DataType::Float.to_string(),
                got: value.type_name().into(),
            })?,
            Err(Error::EmptyHistory(_)) => {
                debug!("peer has no samples yet, skipping tick");
                return Ok(None);
            }
            Err(other) => return Err(other),
        };

        self.local.write_value(&self.model.value, Value::Float(average)).await?;
        Ok(Some(average))
    }

    /// Copies the remote sensor's engineering unit into the local mirror. A
    /// sensor without a unit is odd but not fatal: the mirror keeps its last
    /// value and the tick goes on.
    async fn mirror_unit(&self, sensor: &NodeId) -> Result<()> {
        let name = QualifiedName::new(self.config.sensor_name.namespace, "EngineeringUnit");
        match self.remote.find_child(sensor, &name).await {
            Ok(unit) => {
                let value = self.remote.read_value(&unit.id).await?;
                self.local.write_value(&self.model.engineering_unit, value).await
            }
            Err(Error::NotFound(_)) => {
                warn!(%sensor, "remote sensor has no engineering unit");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn resolve_calibration(&self) -> Result<Node> {
        let methods = self.remote.methods_of(&NodeId::OBJECTS_FOLDER).await?;
        methods.into_iter().find(|method| method.browse_name == self.config.method_name).ok_or_else(
            || Error::NotFound(format!("method {} on the peer", self.config.method_name)),
        )
    }

    /// Spawns the loop: sleep, tick, repeat until stopped.
    ///
    /// Every tick failure is logged and retried after the normal delay; the
    /// loop never terminates itself.
    pub fn spawn(self) -> LoopHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            debug!(peer = %self.remote.address(), "aggregation loop started");
            // Sleep-then-act, same cadence as the producing side.
            let interval = self.config.tick_interval;
            let mut tick = time::interval_at(Instant::now() + interval, interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    // Stop is honored between ticks, never mid-pull.
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = tick.tick() => match self.tick().await {
                        Ok(Some(average)) => debug!(average, "moving average republished"),
                        Ok(None) => {}
                        Err(error) => warn!(%error, "aggregation tick failed, retrying next tick"),
                    },
                }
            }
            debug!("aggregation loop stopped");
        });
        LoopHandle::new(stop_tx, task)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{build_sensor_model, SensorModel, TEMPERATURE_UNIT};
    use crate::space::SessionHub;

    async fn sensor_space_with_history(readings: &[i64]) -> (Arc<AddressSpace>, SensorModel) {
        let space = Arc::new(AddressSpace::new());
        let model = build_sensor_model(&space).await.unwrap();
        for reading in readings {
            space.write_value(&model.sensor_value, Value::Int(*reading)).await.unwrap();
        }
        (space, model)
    }

    #[tokio::test]
    async fn test_monitor_model_shape() {
        let space = AddressSpace::new();
        let model = build_monitor_model(&space).unwrap();

        let notifier = space.get_attribute(&model.object, AttributeId::EventNotifier).await;
        assert_eq!(notifier.unwrap(), Value::Bool(true));
        let unit = space.read_value(&model.engineering_unit).await.unwrap();
        assert_eq!(unit, Value::String(String::new()));
        let historizing = space.get_attribute(&model.value, AttributeId::Historizing).await;
        assert_eq!(historizing.unwrap(), Value::Bool(true));

        // The method hangs off the Objects folder, not the object itself.
        let methods = space.methods_of(&NodeId::OBJECTS_FOLDER).await.unwrap();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].id, model.average_method);
    }

    #[tokio::test]
    async fn test_moving_average_rounding() {
        let space = AddressSpace::new();
        let model = build_monitor_model(&space).unwrap();
        let objects = NodeId::OBJECTS_FOLDER;
        let average = |values: Vec<f64>| {
            let args = vec![Value::from(values)];
            space.invoke_method(&objects, &model.average_method, args)
        };

        assert_eq!(average(vec![20.0, 25.0, 30.0]).await.unwrap(), Value::Float(25.0));
        assert_eq!(average(vec![20.0, 21.0]).await.unwrap(), Value::Float(20.5));
        // Thirds round to three decimals.
        assert_eq!(average(vec![1.0, 2.0, 4.0]).await.unwrap(), Value::Float(2.333));
    }

    #[tokio::test]
    async fn test_moving_average_rejects_empty() {
        let space = AddressSpace::new();
        let model = build_monitor_model(&space).unwrap();

        let err = space
            .invoke_method(
                &NodeId::OBJECTS_FOLDER,
                &model.average_method,
                vec![Value::List(Vec::new())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyHistory(_)));
    }

    #[tokio::test]
    async fn test_pull_is_newest_first_and_calibrated() {
        let hub = SessionHub::new();
        let (_space, model) = {
            let (space, model) = sensor_space_with_history(&[20, 25, 30]).await;
            hub.bind("sensor:4840", Arc::clone(&space));
            (space, model)
        };
        let remote = hub.connect("sensor:4840").unwrap();

        let raw = pull_calibrated_history(
            &remote,
            &model.sensor,
            &NodeId::OBJECTS_FOLDER,
            &model.calibration_method,
            None,
        )
        .await
        .unwrap();
        assert_eq!(raw, vec![30.0, 25.0, 20.0]);

        let calibrated = pull_calibrated_history(
            &remote,
            &model.sensor,
            &NodeId::OBJECTS_FOLDER,
            &model.calibration_method,
            Some(CalibrationParams::new(2.0, 1.0)),
        )
        .await
        .unwrap();
        assert_eq!(calibrated, vec![61.0, 51.0, 41.0]);
    }

    #[tokio::test]
    async fn test_tick_republishes_average_and_unit() {
        let hub = SessionHub::new();
        let (sensor_space, _) = sensor_space_with_history(&[20, 25, 30]).await;
        hub.bind("sensor:4840", sensor_space);

        let local = Arc::new(AddressSpace::new());
        let model = build_monitor_model(&local).unwrap();
        let remote = hub.connect("sensor:4840").unwrap();
        let run = AggregationLoop::new(
            remote,
            Arc::clone(&local),
            model.clone(),
            AggregationConfig::default(),
        );

        assert_eq!(run.tick().await.unwrap(), Some(25.0));

        assert_eq!(local.read_value(&model.value).await.unwrap(), Value::Float(25.0));
        let unit = local.read_value(&model.engineering_unit).await.unwrap();
        assert_eq!(unit, Value::String(TEMPERATURE_UNIT.into()));
        // The republished average historizes locally too.
        let history = local.read_history(&model.value).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_skips_while_peer_has_no_samples() {
        let hub = SessionHub::new();
        let (sensor_space, _) = sensor_space_with_history(&[]).await;
        hub.bind("sensor:4840", sensor_space);

        let local = Arc::new(AddressSpace::new());
        let model = build_monitor_model(&local).unwrap();
        let remote = hub.connect("sensor:4840").unwrap();
        let run = AggregationLoop::new(
            remote,
            Arc::clone(&local),
            model.clone(),
            AggregationConfig::default(),
        );

        assert_eq!(run.tick().await.unwrap(), None);
        // Nothing written: neither the value nor its history moved.
        assert_eq!(local.read_value(&model.value).await.unwrap(), Value::Float(0.0));
        assert!(local.read_history(&model.value).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_reports_missing_peer_model() {
        let hub = SessionHub::new();
        hub.bind("sensor:4840", Arc::new(AddressSpace::new()));

        let local = Arc::new(AddressSpace::new());
        let model = build_monitor_model(&local).unwrap();
        let remote = hub.connect("sensor:4840").unwrap();
        let run = AggregationLoop::new(remote, local, model, AggregationConfig::default());

        // Bare peer: no TemperatureSensor to resolve.
        let err = run.tick().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
