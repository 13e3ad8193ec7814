//! End-to-end tests for the two-node flow: a producing space bound on a
//! session hub and a monitoring space that pulls calibrated history and
//! republishes the moving average.
//!
//! Timed scenarios run on paused time; the rest drive single ticks by hand.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time;

use sensorspace::aggregate::{self, AggregationConfig, AggregationLoop, MonitorModel};
use sensorspace::sensor::{self, SensorLoopConfig, SensorModel, TEMPERATURE_UNIT};
use sensorspace::{
    AddressSpace, AttributeId, AttributeSet, CalibrationParams, DataType, Error, NodeClass,
    NodeId, NodeSpace, QualifiedName, SessionHub, Value,
};

const PRODUCER: &str = "producer:4840";

// ============================================================================
// Helper: one bound producer and one monitor wired through the hub.
// ============================================================================

struct TwoNodes {
    hub: SessionHub,
    producer: Arc<AddressSpace>,
    producer_model: SensorModel,
    monitor: Arc<AddressSpace>,
    monitor_model: MonitorModel,
}

async fn two_nodes(readings: &[i64]) -> TwoNodes {
    let hub = SessionHub::new();

    let producer = Arc::new(AddressSpace::new());
    let producer_model = sensor::build_sensor_model(&producer).await.unwrap();
    for reading in readings {
        producer.write_value(&producer_model.sensor_value, Value::Int(*reading)).await.unwrap();
    }
    hub.bind(PRODUCER, Arc::clone(&producer));

    let monitor = Arc::new(AddressSpace::new());
    let monitor_model = aggregate::build_monitor_model(&monitor).unwrap();

    TwoNodes { hub, producer, producer_model, monitor, monitor_model }
}

fn aggregation(nodes: &TwoNodes, config: AggregationConfig) -> AggregationLoop {
    let remote = nodes.hub.connect(PRODUCER).unwrap();
    AggregationLoop::new(remote, Arc::clone(&nodes.monitor), nodes.monitor_model.clone(), config)
}

// ============================================================================
// 1. One tick: pull, average, republish, mirror the unit
// ============================================================================

#[tokio::test]
async fn test_tick_republishes_average() {
    let nodes = two_nodes(&[20, 25, 30]).await;
    let run = aggregation(&nodes, AggregationConfig::default());

    assert_eq!(run.tick().await.unwrap(), Some(25.0));

    let average = nodes.monitor.read_value(&nodes.monitor_model.value).await.unwrap();
    assert_eq!(average, Value::Float(25.0));
    let unit = nodes.monitor.read_value(&nodes.monitor_model.engineering_unit).await.unwrap();
    assert_eq!(unit, Value::String(TEMPERATURE_UNIT.into()));
    // The republished value historizes on the monitor side.
    assert_eq!(nodes.monitor.read_history(&nodes.monitor_model.value).await.unwrap().len(), 1);
    // Shared nothing: the producer's history was only read.
    let remote_history =
        nodes.producer.read_history(&nodes.producer_model.sensor_value).await.unwrap();
    assert_eq!(remote_history.len(), 3);
}

// ============================================================================
// 2. Calibration parameters travel with every pull
// ============================================================================

#[tokio::test]
async fn test_tick_applies_calibration() {
    let nodes = two_nodes(&[20, 25, 30]).await;
    let config = AggregationConfig {
        calibration: Some(CalibrationParams::new(2.0, 1.0)),
        ..AggregationConfig::default()
    };
    let run = aggregation(&nodes, config);

    // Calibrated samples are [61, 51, 41], newest first.
    assert_eq!(run.tick().await.unwrap(), Some(51.0));
}

// ============================================================================
// 3. Averages round to three decimals
// ============================================================================

#[tokio::test]
async fn test_tick_rounds_to_three_decimals() {
    let nodes = two_nodes(&[1, 2, 4]).await;
    let run = aggregation(&nodes, AggregationConfig::default());

    assert_eq!(run.tick().await.unwrap(), Some(2.333));
}

// ============================================================================
// 4. An empty remote history skips the write, not the tick
// ============================================================================

#[tokio::test]
async fn test_tick_skips_empty_history() {
    let nodes = two_nodes(&[]).await;
    let run = aggregation(&nodes, AggregationConfig::default());

    assert_eq!(run.tick().await.unwrap(), None);

    assert_eq!(
        nodes.monitor.read_value(&nodes.monitor_model.value).await.unwrap(),
        Value::Float(0.0)
    );
    assert!(nodes.monitor.read_history(&nodes.monitor_model.value).await.unwrap().is_empty());
    // The unit is still mirrored; it does not depend on having samples.
    let unit = nodes.monitor.read_value(&nodes.monitor_model.engineering_unit).await.unwrap();
    assert_eq!(unit, Value::String(TEMPERATURE_UNIT.into()));
}

// ============================================================================
// 5. A sensor without a unit property still aggregates
// ============================================================================

#[tokio::test]
async fn test_tick_tolerates_missing_unit() {
    let hub = SessionHub::new();

    // Hand-built producer: a bare sensor with a historized value and the
    // calibration method, but no EngineeringUnit property.
    let producer = Arc::new(AddressSpace::new());
    let bare = producer
        .create_node(
            &NodeId::OBJECTS_FOLDER,
            NodeClass::Object,
            QualifiedName::new(2, "TemperatureSensor"),
            AttributeSet::object(),
        )
        .unwrap();
    let value = producer
        .create_node(
            &bare,
            NodeClass::Variable,
            QualifiedName::new(2, "SensorValue"),
            AttributeSet::variable(DataType::Float, 0.0),
        )
        .unwrap();
    producer.enable_history(&value, 10).unwrap();
    sensor::register_calibration_method(&producer, &NodeId::OBJECTS_FOLDER).unwrap();
    producer.write_value(&value, Value::Int(24)).await.unwrap();
    hub.bind(PRODUCER, Arc::clone(&producer));

    let monitor = Arc::new(AddressSpace::new());
    let monitor_model = aggregate::build_monitor_model(&monitor).unwrap();
    let remote = hub.connect(PRODUCER).unwrap();
    let run = AggregationLoop::new(
        remote,
        Arc::clone(&monitor),
        monitor_model.clone(),
        AggregationConfig::default(),
    );

    assert_eq!(run.tick().await.unwrap(), Some(24.0));
    // The local mirror keeps its previous (empty) unit.
    let unit = monitor.read_value(&monitor_model.engineering_unit).await.unwrap();
    assert_eq!(unit, Value::String(String::new()));
}

// ============================================================================
// 6. Teardown surfaces as RemoteUnavailable; a rebind serves new sessions
// ============================================================================

#[tokio::test]
async fn test_unbind_then_rebind() {
    let nodes = two_nodes(&[20]).await;
    let run = aggregation(&nodes, AggregationConfig::default());
    assert_eq!(run.tick().await.unwrap(), Some(20.0));

    nodes.hub.unbind(PRODUCER);
    tokio::task::yield_now().await;
    let err = run.tick().await.unwrap_err();
    assert!(matches!(err, Error::RemoteUnavailable(_)));

    // A fresh session against the rebound address works again.
    nodes.hub.bind(PRODUCER, Arc::clone(&nodes.producer));
    let recovered = aggregation(&nodes, AggregationConfig::default());
    assert_eq!(recovered.tick().await.unwrap(), Some(20.0));
}

// ============================================================================
// 7. The spawned loop retries failed ticks and never stops itself
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_spawned_loop_survives_teardown() {
    let nodes = two_nodes(&[20, 25, 30]).await;
    let handle = aggregation(&nodes, AggregationConfig::default()).spawn();

    // First tick fires after one interval (the loop sleeps first).
    time::sleep(Duration::from_millis(600)).await;
    let average = nodes.monitor.read_value(&nodes.monitor_model.value).await.unwrap();
    assert_eq!(average, Value::Float(25.0));

    nodes.hub.unbind(PRODUCER);
    time::sleep(Duration::from_millis(2000)).await;
    // Ticks keep failing and being retried; the loop is still alive.
    assert!(!handle.is_finished());
    assert_eq!(
        nodes.monitor.read_value(&nodes.monitor_model.value).await.unwrap(),
        Value::Float(25.0)
    );

    handle.stop().await;
}

// ============================================================================
// 8. Full simulation: both loops on paused time
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_two_node_simulation() {
    let nodes = two_nodes(&[]).await;

    let producer_loop = sensor::spawn_sensor_loop(
        Arc::clone(&nodes.producer),
        &nodes.producer_model,
        SensorLoopConfig::default(),
    );
    let aggregation_loop = aggregation(&nodes, AggregationConfig::default()).spawn();

    time::sleep(Duration::from_millis(1600)).await;
    aggregation_loop.stop().await;
    producer_loop.stop().await;

    // Readings are 20..=50, so any average of them stays in that band.
    let average = nodes.monitor.read_value(&nodes.monitor_model.value).await.unwrap();
    let average = average.as_float().unwrap();
    assert!((20.0..=50.0).contains(&average), "average {average} out of range");

    let unit = nodes.monitor.read_value(&nodes.monitor_model.engineering_unit).await.unwrap();
    assert_eq!(unit, Value::String(TEMPERATURE_UNIT.into()));
    assert!(!nodes.monitor.read_history(&nodes.monitor_model.value).await.unwrap().is_empty());
    // Bounded retention on the producer regardless of runtime.
    let produced = nodes.producer.read_history(&nodes.producer_model.sensor_value).await.unwrap();
    assert!(!produced.is_empty());
    assert!(produced.len() <= 10);

    // The monitor's historizing variable is discoverable the same way the
    // producer's sensor is.
    let found = nodes
        .monitor
        .get_attribute(&nodes.monitor_model.object, AttributeId::EventNotifier)
        .await
        .unwrap();
    assert_eq!(found, Value::Bool(true));
}
