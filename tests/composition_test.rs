mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{BMS_SDL, COFFEE_SDL, FMS_SDL, MockTransport, descriptors, test_config};
use graphweave::composer::compose;
use graphweave::error::{Conflict, FetchError, RefreshError};
use graphweave::registry::{RefreshPolicy, SchemaRegistry};
use graphweave::Gateway;

#[test]
fn composes_field_ownership_and_entity_keys() {
    let unified = compose(&descriptors(&[
        ("bms", BMS_SDL),
        ("fms", FMS_SDL),
        ("coffee", COFFEE_SDL),
    ]))
    .expect("composition should succeed");

    let status = unified.field("Device", "status").unwrap();
    assert_eq!(status.owners, vec!["bms".to_string()]);
    let location = unified.field("Device", "location").unwrap();
    assert_eq!(location.owners, vec!["fms".to_string()]);

    // Key fields are implicitly shareable across the declaring subgraphs.
    let id = unified.field("Device", "id").unwrap();
    assert!(id.shareable);
    assert_eq!(id.owners, vec!["bms".to_string(), "fms".to_string()]);

    assert_eq!(unified.entity_keys("Device"), Some(&["id".to_string()][..]));
    assert_eq!(unified.entity_keys("Machine"), Some(&["id".to_string()][..]));

    // coffee's Machine.id is @external, so coffee claims only `level`.
    let level = unified.field("Machine", "level").unwrap();
    assert_eq!(level.owners, vec!["coffee".to_string()]);

    // Root fields from every subgraph end up on one Query type.
    assert!(unified.field("Query", "device").is_some());
    assert!(unified.field("Query", "machine").is_some());
    assert!(unified.field("Query", "beans").is_some());
}

#[test]
fn composition_is_idempotent() {
    let input = descriptors(&[("bms", BMS_SDL), ("fms", FMS_SDL)]);
    let first = compose(&input).unwrap();
    let second = compose(&input).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.version, second.version);
}

#[test]
fn collects_every_conflict_not_just_the_first() {
    let left = r#"
type Device @key(fields: "id") {
  id: ID!
  status: String
}

type Mode { raw: String }
"#;
    let right = r#"
type Device @key(fields: "serial") {
  serial: ID!
  status: Int
}

enum Mode { AUTO }
"#;

    let err = compose(&descriptors(&[("bms", left), ("fms", right)]))
        .expect_err("conflicting schemas must not compose");

    assert_eq!(err.conflicts.len(), 3);
    assert!(err
        .conflicts
        .iter()
        .any(|c| matches!(c, Conflict::KeyMismatch { type_name, .. } if type_name == "Device")));
    assert!(err.conflicts.iter().any(
        |c| matches!(c, Conflict::FieldTypeMismatch { type_name, field, .. } if type_name == "Device" && field == "status")
    ));
    assert!(err
        .conflicts
        .iter()
        .any(|c| matches!(c, Conflict::KindMismatch { type_name, .. } if type_name == "Mode")));
}

#[test]
fn duplicate_field_requires_shareable_on_both_sides() {
    let left = r#"
type Device @key(fields: "id") { id: ID! status: String @shareable }
"#;
    let right = r#"
type Device @key(fields: "id") { id: ID! status: String }
"#;
    let err = compose(&descriptors(&[("bms", left), ("fms", right)]))
        .expect_err("one-sided shareable must conflict");
    assert!(matches!(
        err.conflicts.as_slice(),
        [Conflict::DuplicateField { field, .. }] if field == "status"
    ));

    let both = r#"
type Device @key(fields: "id") { id: ID! status: String @shareable }
"#;
    let unified = compose(&descriptors(&[("bms", both), ("fms", both)])).unwrap();
    let status = unified.field("Device", "status").unwrap();
    assert_eq!(status.owners.len(), 2);
}

#[tokio::test]
async fn failed_composition_keeps_previous_schema_published() {
    let transport = Arc::new(MockTransport::new());
    transport.add("bms", BMS_SDL);
    transport.add("fms", FMS_SDL);

    let config = test_config(&["bms", "fms"]);
    let gateway = Gateway::new(&config, transport.clone());

    assert!(gateway.refresh().await.unwrap());
    let before = gateway.schema().expect("schema published");

    // fms redeclares Device with an incompatible key.
    transport.set_sdl(
        "fms",
        r#"type Device @key(fields: "serial") { serial: ID! location: String }"#,
    );
    let err = gateway.refresh().await.expect_err("must not recompose");
    assert!(matches!(err, RefreshError::Composition(_)));

    let after = gateway.schema().expect("schema still published");
    assert_eq!(before.version, after.version);
    assert_eq!(*before, *after);
}

#[tokio::test]
async fn unreachable_new_subgraph_does_not_block_the_rest() {
    let transport = Arc::new(MockTransport::new());
    transport.add("bms", BMS_SDL);
    transport.add("coffee", COFFEE_SDL);
    transport.sdl_unreachable("coffee");

    let config = test_config(&["bms", "coffee"]);
    let registry = SchemaRegistry::new(transport.clone(), RefreshPolicy::FailOpen);

    let fetched = registry.fetch(&config.endpoints()).await.unwrap();
    assert!(fetched["bms"].health.is_healthy());
    assert!(!fetched["coffee"].health.is_healthy());
    assert!(!fetched["coffee"].has_schema());

    // Retries happened before giving up.
    assert_eq!(transport.sdl_fetches("coffee"), 2);

    let unified = compose(&fetched).unwrap();
    assert!(unified.field("Query", "device").is_some());
    assert!(unified.field("Query", "beans").is_none());
}

#[tokio::test]
async fn disappeared_subgraph_fail_open_keeps_stale_schema() {
    let transport = Arc::new(MockTransport::new());
    transport.add("bms", BMS_SDL);

    let config = test_config(&["bms"]);
    let registry = SchemaRegistry::new(transport.clone(), RefreshPolicy::FailOpen);

    let first = registry.fetch(&config.endpoints()).await.unwrap();
    assert!(first["bms"].health.is_healthy());

    transport.sdl_unreachable("bms");
    let second = registry.fetch(&config.endpoints()).await.unwrap();
    assert!(!second["bms"].health.is_healthy());
    assert_eq!(second["bms"].sdl, first["bms"].sdl);
}

#[tokio::test]
async fn disappeared_subgraph_fail_closed_blocks_refresh() {
    let transport = Arc::new(MockTransport::new());
    transport.add("bms", BMS_SDL);

    let config = test_config(&["bms"]);
    let registry = SchemaRegistry::new(transport.clone(), RefreshPolicy::FailClosed);

    registry.fetch(&config.endpoints()).await.unwrap();

    transport.sdl_unreachable("bms");
    let err = registry.fetch(&config.endpoints()).await.unwrap_err();
    assert!(matches!(err, FetchError::Disappeared { subgraph, .. } if subgraph == "bms"));
}

#[tokio::test]
async fn schema_change_emits_event_and_republishes() {
    let transport = Arc::new(MockTransport::new());
    transport.add("bms", BMS_SDL);

    let config = test_config(&["bms"]);
    let gateway = Gateway::new(&config, transport.clone());
    let mut published = gateway.subscribe();

    assert!(gateway.refresh().await.unwrap());
    assert!(published.has_changed().unwrap());
    let v1 = published
        .borrow_and_update()
        .as_ref()
        .unwrap()
        .version
        .clone();

    // Unchanged input publishes nothing new, to subscribers either.
    assert!(!gateway.refresh().await.unwrap());
    assert!(!published.has_changed().unwrap());

    transport.set_sdl(
        "bms",
        r#"
type Device @key(fields: "id") { id: ID! status: String firmware: String }
type Query { device(id: ID!): Device }
"#,
    );
    assert!(gateway.refresh().await.unwrap());
    assert!(published.has_changed().unwrap());
    let v2 = published.borrow_and_update().clone().unwrap();
    assert_ne!(v1, v2.version);
    assert!(v2.field("Device", "firmware").is_some());
}

#[tokio::test]
async fn registry_broadcasts_per_subgraph_change_events() {
    let transport = Arc::new(MockTransport::new());
    transport.add("bms", BMS_SDL);
    transport.add("fms", FMS_SDL);

    let config = test_config(&["bms", "fms"]);
    let registry = SchemaRegistry::new(transport.clone(), RefreshPolicy::FailOpen);
    let mut changes = registry.subscribe();

    // The first fetch announces every subgraph that served a schema.
    registry.fetch(&config.endpoints()).await.unwrap();
    let mut announced = vec![
        changes.try_recv().unwrap().subgraph,
        changes.try_recv().unwrap().subgraph,
    ];
    announced.sort();
    assert_eq!(announced, vec!["bms".to_string(), "fms".to_string()]);
    assert!(changes.try_recv().is_err());

    // An unchanged refetch stays silent.
    registry.fetch(&config.endpoints()).await.unwrap();
    assert!(changes.try_recv().is_err());

    // Only the subgraph whose SDL differs fires an event.
    transport.set_sdl(
        "bms",
        r#"
type Device @key(fields: "id") { id: ID! status: String firmware: String }
type Query { device(id: ID!): Device }
"#,
    );
    registry.fetch(&config.endpoints()).await.unwrap();
    let event = changes.try_recv().unwrap();
    assert_eq!(event.subgraph, "bms");
    assert!(changes.try_recv().is_err());
}
