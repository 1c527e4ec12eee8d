//! Integration tests: several processes sharing one in-memory broker.

use changefeed::{
    codec, ChannelSubscriber, Collection, Config, ConnectionRole, Delivery, DeliveryHandle, Envelope,
    Event, FieldInterest, MemoryBroker, MemoryCollection, PubSub, PublishOptions, Subscriber,
    SubscriptionManager, TransportClient, WireFormat,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn process(broker: &MemoryBroker, config: Config) -> SubscriptionManager {
    let client = Arc::new(TransportClient::new(&config, Arc::new(broker.clone())));
    SubscriptionManager::new(config, client)
}

fn doc(value: Value) -> changefeed::Document {
    value.as_object().cloned().unwrap()
}

fn subscribe(
    manager: &SubscriptionManager,
    channels: &[&str],
    collection: &Arc<MemoryCollection>,
    interest: FieldInterest,
) -> (Arc<dyn Subscriber>, DeliveryHandle) {
    let collection: Arc<dyn Collection> = Arc::clone(collection) as Arc<dyn Collection>;
    let (sub, handle) = ChannelSubscriber::new(
        channels.iter().map(|c| c.to_string()).collect(),
        collection,
        interest,
    );
    let sub: Arc<dyn Subscriber> = sub;
    manager.attach(Arc::clone(&sub));
    (sub, handle)
}

fn drained(handle: &DeliveryHandle) -> Vec<Delivery> {
    handle.receiver.try_iter().collect()
}

const REMOTE_ONLY: PublishOptions = PublishOptions {
    push_to_transport: true,
    optimistic: false,
};

// --- Scenarios ---

#[test]
fn test_synthetic_update_reaches_remote_subscriber_once() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    let (_s1, handle) = subscribe(&b, &["c1"], &tasks, FieldInterest::All);
    b.flush().unwrap();

    let env = Envelope::synthetic(Event::Update, doc(json!({"_id": "1"})), json!({"$set": {"x": 1}}));
    a.publish_with("c1", env, REMOTE_ONLY);
    b.flush().unwrap();

    let deliveries = drained(&handle);
    assert_eq!(
        deliveries,
        vec![Delivery::Synthetic {
            event: Event::Update,
            doc: doc(json!({"_id": "1"})),
            modifier: Some(json!({"$set": {"x": 1}})),
            modified_top_level_fields: Some(vec!["x".to_string()]),
        }]
    );
    // Synthetic events never touch storage.
    assert_eq!(tasks.fetch_count(), 0);
}

#[test]
fn test_detached_channel_is_gone() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));
    tasks.insert(doc(json!({"_id": "1", "x": 0}))).unwrap();

    let (s1, handle) = subscribe(&b, &["c1"], &tasks, FieldInterest::All);
    b.detach(&s1);
    assert!(b.channels().unwrap().is_empty());

    a.publish_with("c1", Envelope::insert(doc(json!({"_id": "1"}))), REMOTE_ONLY);
    b.flush().unwrap();

    assert!(drained(&handle).is_empty());
    assert_eq!(tasks.fetch_count(), 0);
}

#[test]
fn test_remove_is_delivered_without_fetch() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    let (_s1, handle) = subscribe(&b, &["c1"], &tasks, FieldInterest::All);
    b.flush().unwrap();

    a.publish_with("c1", Envelope::remove(doc(json!({"_id": "42"}))), REMOTE_ONLY);
    b.flush().unwrap();

    assert_eq!(
        drained(&handle),
        vec![Delivery::Change {
            event: Event::Remove,
            doc: doc(json!({"_id": "42"})),
            fields: None,
        }]
    );
    assert_eq!(tasks.fetch_count(), 0);
}

// --- Self-echo ---

#[test]
fn test_own_events_from_transport_are_dropped() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));
    tasks.insert(doc(json!({"_id": "1"}))).unwrap();

    let (_s, handle) = subscribe(&a, &["c1"], &tasks, FieldInterest::All);
    a.flush().unwrap();

    // What the transport hands back after `a` applied these optimistically.
    let raw = broker.open(ConnectionRole::Publisher);
    let echoes = [
        Envelope::insert(doc(json!({"_id": "1"}))),
        Envelope::remove(doc(json!({"_id": "1"}))),
        Envelope::synthetic(Event::Update, doc(json!({"_id": "1"})), json!({"$set": {"y": 2}})),
    ];
    for env in echoes {
        let payload = codec::encode(&env.with_uid(a.uid().to_string()), WireFormat::Json).unwrap();
        raw.publish("c1", &payload).unwrap();
    }
    a.flush().unwrap();

    assert_eq!(broker.published_count(), 3);
    assert!(drained(&handle).is_empty());
    assert_eq!(tasks.fetch_count(), 0);
}

#[test]
fn test_non_optimistic_publish_reaches_own_subscriber_once() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));
    tasks.insert(doc(json!({"_id": "1", "title": "t"}))).unwrap();

    let (_s, handle) = subscribe(&a, &["c1"], &tasks, FieldInterest::All);
    a.flush().unwrap();

    a.publish_with("c1", Envelope::remove(doc(json!({"_id": "1"}))), REMOTE_ONLY);
    a.publish_with("c1", Envelope::insert(doc(json!({"_id": "1"}))), REMOTE_ONLY);
    a.flush().unwrap();

    let deliveries = drained(&handle);
    assert_eq!(
        deliveries.iter().map(Delivery::event).collect::<Vec<_>>(),
        vec![Event::Remove, Event::Insert]
    );
    assert_eq!(deliveries[1].doc(), &doc(json!({"_id": "1", "title": "t"})));
    assert_eq!(broker.published_count(), 2);
}

#[test]
fn test_optimistic_publish_is_applied_once() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));
    tasks.insert(doc(json!({"_id": "1", "title": "t"}))).unwrap();

    let (_sa, local) = subscribe(&a, &["c1"], &tasks, FieldInterest::All);
    let (_sb, remote) = subscribe(&b, &["c1"], &tasks, FieldInterest::All);
    a.flush().unwrap();
    b.flush().unwrap();

    a.publish("c1", Envelope::insert(doc(json!({"_id": "1", "title": "t"}))));
    a.flush().unwrap();
    b.flush().unwrap();

    assert_eq!(drained(&local).len(), 1);
    assert_eq!(drained(&remote).len(), 1);
}

#[test]
fn test_same_uid_from_local_path_is_applied() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    let (_s, handle) = subscribe(&a, &["c1"], &tasks, FieldInterest::All);
    let env = Envelope::remove(doc(json!({"_id": "9"}))).with_uid(a.uid().to_string());
    a.process("c1", env);
    a.flush().unwrap();

    assert_eq!(drained(&handle).len(), 1);
}

// --- Authoritative document resolution ---

#[test]
fn test_update_delivers_current_storage_state() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));
    tasks.insert(doc(json!({"_id": "1", "status": "draft"}))).unwrap();

    let (_s, handle) = subscribe(&b, &["tasks"], &tasks, FieldInterest::All);
    b.flush().unwrap();

    // A later write lands before the event is dispatched.
    tasks.update(&json!("1"), doc(json!({"status": "published"})));
    a.publish_with(
        "tasks",
        Envelope::update(doc(json!({"_id": "1", "status": "review"})), vec!["status".into()]),
        REMOTE_ONLY,
    );
    b.flush().unwrap();

    assert_eq!(
        drained(&handle),
        vec![Delivery::Change {
            event: Event::Update,
            doc: doc(json!({"_id": "1", "status": "published"})),
            fields: Some(vec!["status".to_string()]),
        }]
    );
    assert_eq!(tasks.fetch_count(), 1);
}

#[test]
fn test_unprotected_collection_trusts_envelope() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::without_race_protection("tasks"));
    tasks.insert(doc(json!({"_id": "1", "status": "published"}))).unwrap();

    let (_s, handle) = subscribe(&b, &["tasks"], &tasks, FieldInterest::All);
    b.flush().unwrap();

    a.publish_with(
        "tasks",
        Envelope::update(doc(json!({"_id": "1", "status": "review"})), vec!["status".into()]),
        REMOTE_ONLY,
    );
    b.flush().unwrap();

    let deliveries = drained(&handle);
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].doc(), &doc(json!({"_id": "1", "status": "review"})));
    assert_eq!(tasks.fetch_count(), 0);
}

#[test]
fn test_fetch_uses_union_of_field_interest() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));
    tasks
        .insert(doc(json!({"_id": "1", "a": 1, "b": 2, "c": 3, "d": 4})))
        .unwrap();

    let (_s1, h1) = subscribe(&b, &["tasks"], &tasks, FieldInterest::only(["a", "b"]));
    let (_s2, h2) = subscribe(&b, &["tasks"], &tasks, FieldInterest::only(["b", "c"]));
    b.flush().unwrap();

    a.publish_with("tasks", Envelope::insert(doc(json!({"_id": "1"}))), REMOTE_ONLY);
    b.flush().unwrap();

    let expected = doc(json!({"_id": "1", "a": 1, "b": 2, "c": 3}));
    assert_eq!(drained(&h1)[0].doc(), &expected);
    assert_eq!(drained(&h2)[0].doc(), &expected);
    // One fetch for the whole channel.
    assert_eq!(tasks.fetch_count(), 1);
}

#[test]
fn test_all_fields_subscriber_widens_fetch() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));
    tasks
        .insert(doc(json!({"_id": "1", "a": 1, "b": 2, "z": 26})))
        .unwrap();

    let (_s1, h1) = subscribe(&b, &["tasks"], &tasks, FieldInterest::only(["a"]));
    let (_s2, _h2) = subscribe(&b, &["tasks"], &tasks, FieldInterest::All);
    b.flush().unwrap();

    a.publish_with("tasks", Envelope::insert(doc(json!({"_id": "1"}))), REMOTE_ONLY);
    b.flush().unwrap();

    assert_eq!(drained(&h1)[0].doc(), &doc(json!({"_id": "1", "a": 1, "b": 2, "z": 26})));
}

#[test]
fn test_document_deleted_before_dispatch_is_dropped() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    let (_s, handle) = subscribe(&b, &["tasks"], &tasks, FieldInterest::All);
    b.flush().unwrap();

    a.publish_with("tasks", Envelope::insert(doc(json!({"_id": "gone"}))), REMOTE_ONLY);
    b.flush().unwrap();

    assert!(drained(&handle).is_empty());
    assert_eq!(tasks.fetch_count(), 1);
}

// --- Configuration ---

#[test]
fn test_external_publisher_only_applies_locally() {
    let broker = MemoryBroker::new();
    let config = Config {
        external_publisher: true,
        ..Default::default()
    };
    let a = process(&broker, config);
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    let (_s, handle) = subscribe(&a, &["c1"], &tasks, FieldInterest::All);
    a.publish("c1", Envelope::remove(doc(json!({"_id": "1"}))));
    a.flush().unwrap();

    assert_eq!(broker.published_count(), 0);
    assert_eq!(drained(&handle).len(), 1);
}

#[test]
fn test_prefixed_fleet_with_msgpack() {
    let broker = MemoryBroker::new();
    let config = || Config {
        global_prefix: "tenant-7:".into(),
        wire_format: WireFormat::Msgpack,
        ..Default::default()
    };
    let a = process(&broker, config());
    let b = process(&broker, config());
    let plain = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    let (_s, handle) = subscribe(&b, &["c1"], &tasks, FieldInterest::All);
    let (_p, unprefixed) = subscribe(&plain, &["c1"], &tasks, FieldInterest::All);
    b.flush().unwrap();
    plain.flush().unwrap();

    a.publish_with(
        "c1",
        Envelope::synthetic(Event::Insert, doc(json!({"_id": "1", "n": 1})), json!({"n": 1})),
        REMOTE_ONLY,
    );
    b.flush().unwrap();
    plain.flush().unwrap();

    assert_eq!(drained(&handle).len(), 1);
    assert!(drained(&unprefixed).is_empty());
    assert_eq!(broker.handler_count("tenant-7:c1"), 1);
}

// --- Ordering ---

#[test]
fn test_channel_events_arrive_in_publish_order() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::without_race_protection("tasks"));

    let (_s, handle) = subscribe(&b, &["c1"], &tasks, FieldInterest::All);
    b.flush().unwrap();

    for i in 0..200 {
        a.publish_with(
            "c1",
            Envelope::update(doc(json!({"_id": "1", "n": i})), vec!["n".into()]),
            REMOTE_ONLY,
        );
    }
    b.flush().unwrap();

    let seen: Vec<i64> = drained(&handle)
        .iter()
        .map(|d| d.doc()["n"].as_i64().unwrap())
        .collect();
    assert_eq!(seen, (0..200).collect::<Vec<i64>>());
}

#[test]
fn test_attach_is_ordered_before_later_events() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    // No flush between attach and the local event: queue order alone
    // guarantees the subscriber is registered first.
    let (_s, handle) = subscribe(&a, &["c1"], &tasks, FieldInterest::All);
    a.process("c1", Envelope::remove(doc(json!({"_id": "1"}))).with_uid("peer"));

    let delivery = handle.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(delivery.event(), Event::Remove);
}

#[test]
fn test_subscribers_on_many_channels() {
    let broker = MemoryBroker::new();
    let a = process(&broker, Config::default());
    let b = process(&broker, Config::default());
    let tasks = Arc::new(MemoryCollection::new("tasks"));

    let (_s, handle) = subscribe(&b, &["tasks", "tasks::1", "tasks::2"], &tasks, FieldInterest::All);
    b.flush().unwrap();
    assert_eq!(b.channels().unwrap(), vec!["tasks", "tasks::1", "tasks::2"]);

    for channel in ["tasks", "tasks::2", "other"] {
        a.publish_with(channel, Envelope::remove(doc(json!({"_id": channel}))), REMOTE_ONLY);
    }
    b.flush().unwrap();

    let ids: Vec<Value> = drained(&handle).iter().map(|d| d.doc()["_id"].clone()).collect();
    assert_eq!(ids, vec![json!("tasks"), json!("tasks::2")]);
}
