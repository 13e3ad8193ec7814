//! End-to-end tests for the address space: building the sensor model,
//! browsing by name, typed attributes, instantiation, method invocation and
//! the JSON export.
//!
//! Each test drives the public API the way a node process would.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use sensorspace::sensor::{self, SENSOR_MODEL_INFO, TEMPERATURE_UNIT};
use sensorspace::{
    export, AddressSpace, AttributeSet, BrowseDirection, Error, NodeClass, NodeId, NodeSpace,
    QualifiedName, ReferenceType, SensorModel, Value,
};

// ============================================================================
// Helper: a space with the sensor model built.
// ============================================================================

async fn sensor_space() -> (Arc<AddressSpace>, SensorModel) {
    let space = Arc::new(AddressSpace::new());
    let model = sensor::build_sensor_model(&space).await.unwrap();
    (space, model)
}

// ============================================================================
// 1. Resolve the sensor from the root by browse names
// ============================================================================

#[tokio::test]
async fn test_resolve_sensor_from_root() {
    let (space, model) = sensor_space().await;

    let path = [QualifiedName::from("0:Objects"), QualifiedName::from("2:TemperatureSensor")];
    let found = space.resolve_path(&NodeId::ROOT_FOLDER, &path).await.unwrap();

    assert_eq!(found.id, model.sensor);
    assert_eq!(found.class, NodeClass::Object);
    assert_eq!(found.display_name(), "TemperatureSensor");

    let info = sensor::model_information(&*space, &found.id).await.unwrap();
    assert_eq!(info.as_deref(), Some(SENSOR_MODEL_INFO));
}

// ============================================================================
// 2. Value writes are checked against the declared type
// ============================================================================

#[tokio::test]
async fn test_value_writes_are_typed() {
    let (space, model) = sensor_space().await;

    // Int widens into the Float slot.
    space.write_value(&model.sensor_value, Value::Int(21)).await.unwrap();
    assert_eq!(space.read_value(&model.sensor_value).await.unwrap(), Value::Int(21));

    let err = space.write_value(&model.sensor_value, Value::from("warm")).await.unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));

    // A rejected write leaves the stored value alone.
    assert_eq!(space.read_value(&model.sensor_value).await.unwrap(), Value::Int(21));
}

// ============================================================================
// 3. A second instance is independent of the first
// ============================================================================

#[tokio::test]
async fn test_instances_are_independent() {
    let (space, model) = sensor_space().await;

    let second = space
        .instantiate(
            &model.temperature_type,
            &NodeId::OBJECTS_FOLDER,
            QualifiedName::new(2, "BoilerSensor"),
        )
        .unwrap();
    let second_value =
        space.find_child(&second, &QualifiedName::new(2, "SensorValue")).await.unwrap().id;

    space.write_value(&second_value, Value::Int(99)).await.unwrap();
    assert_eq!(space.read_value(&model.sensor_value).await.unwrap(), Value::Float(0.0));

    // Each instance points back at its type.
    let definition = space
        .browse(&second, BrowseDirection::Forward, Some(ReferenceType::HasTypeDefinition), None)
        .await
        .unwrap();
    assert_eq!(definition.len(), 1);
    assert_eq!(definition[0].id, model.temperature_type);
}

// ============================================================================
// 4. The abstract base never instantiates
// ============================================================================

#[tokio::test]
async fn test_abstract_base_rejected() {
    let (space, model) = sensor_space().await;

    let err = space
        .instantiate(&model.base_type, &NodeId::OBJECTS_FOLDER, QualifiedName::new(2, "RawSensor"))
        .unwrap_err();
    assert!(matches!(err, Error::AbstractTypeInstantiation(_)));
}

// ============================================================================
// 5. Calibration method contract
// ============================================================================

#[tokio::test]
async fn test_calibration_method_contract() {
    let (space, model) = sensor_space().await;
    let owner = NodeId::OBJECTS_FOLDER;
    let method = &model.calibration_method;

    // No parameters: identity.
    let out = space.invoke_method(&owner, method, vec![Value::Float(10.0)]).await.unwrap();
    assert_eq!(out, Value::Float(10.0));

    // Slope only, then slope and intercept.
    let out = space
        .invoke_method(&owner, method, vec![Value::Float(10.0), Value::Float(2.0)])
        .await
        .unwrap();
    assert_eq!(out, Value::Float(20.0));
    let out = space
        .invoke_method(
            &owner,
            method,
            vec![Value::Float(10.0), Value::Float(2.0), Value::Float(5.0)],
        )
        .await
        .unwrap();
    assert_eq!(out, Value::Float(25.0));

    // Wrong arity or wrong types are argument errors.
    let err = space.invoke_method(&owner, method, vec![]).await.unwrap_err();
    assert!(matches!(err, Error::ArgumentMismatch(_)));
    let err = space.invoke_method(&owner, method, vec![Value::from("ten")]).await.unwrap_err();
    assert!(matches!(err, Error::ArgumentMismatch(_)));
    let err =
        space.invoke_method(&owner, method, vec![Value::Float(1.0); 4]).await.unwrap_err();
    assert!(matches!(err, Error::ArgumentMismatch(_)));

    // The method hangs off the Objects folder, not the sensor.
    let err =
        space.invoke_method(&model.sensor, method, vec![Value::Float(1.0)]).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ============================================================================
// 6. History is bounded and reads back newest first
// ============================================================================

#[tokio::test]
async fn test_history_bounded_newest_first() {
    let (space, model) = sensor_space().await;

    for reading in 0..15 {
        space.write_value(&model.sensor_value, Value::Int(reading)).await.unwrap();
    }

    let history = space.read_history(&model.sensor_value).await.unwrap();
    let values: Vec<Value> = history.into_iter().map(|sample| sample.value).collect();
    let expected: Vec<Value> = (5..15).rev().map(Value::Int).collect();
    assert_eq!(values, expected);
}

// ============================================================================
// 7. Browse names are unique per parent, per namespace
// ============================================================================

#[tokio::test]
async fn test_duplicate_browse_names_rejected() {
    let (space, model) = sensor_space().await;

    let err = space
        .instantiate(
            &model.temperature_type,
            &NodeId::OBJECTS_FOLDER,
            QualifiedName::new(2, "TemperatureSensor"),
        )
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateBrowseName { .. }));

    // Same text in another namespace is a different name.
    space
        .create_node(
            &NodeId::OBJECTS_FOLDER,
            NodeClass::Object,
            QualifiedName::new(3, "TemperatureSensor"),
            AttributeSet::object(),
        )
        .unwrap();
}

// ============================================================================
// 8. Export snapshots the built space
// ============================================================================

#[tokio::test]
async fn test_export_snapshot() {
    let (space, model) = sensor_space().await;
    space.write_value(&model.sensor_value, Value::Int(30)).await.unwrap();

    let document = export::export_json(&space);
    assert_eq!(document["node_count"], json!(space.node_count()));
    assert_eq!(document["reference_count"], json!(space.reference_count()));

    let nodes = document["nodes"].as_array().unwrap();
    let sensor = nodes
        .iter()
        .find(|n| n["browse_name"] == json!("2:TemperatureSensor"))
        .unwrap();
    assert_eq!(sensor["class"], json!("Object"));
    // The instance keeps the link back to its type in the export.
    assert!(sensor["references"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["reference_type"] == json!("HasTypeDefinition")));

    // Two SensorValue nodes exist: the type declaration (still 0.0) and the
    // instance copy carrying the written reading.
    let value_node = nodes
        .iter()
        .find(|n| {
            n["browse_name"] == json!("2:SensorValue") && n["attributes"]["Value"] == json!(30)
        })
        .unwrap();
    assert_eq!(value_node["attributes"]["Historizing"], json!(true));
    assert_eq!(value_node["modelling_rule"], json!("Mandatory"));

    let reading = sensor::current_reading(&*space, &model.sensor).await.unwrap();
    assert_eq!(reading, format!("30{TEMPERATURE_UNIT}"));
}
