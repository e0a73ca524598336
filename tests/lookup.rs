//! End to end tests over an in-memory testnet.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use lodestone::rpc::config::Config;
use lodestone::rpc::wire::MemoryHub;
use lodestone::{
    immutable_key, Bytes, Cancellation, Dht, Id, ImmutableValidator, InvalidIdSize,
    QueryOptions, Record, ReprovideEvent, SignedRecord, SignedRecordValidator, SigningKey,
    Testnet, ValidatorRegistry, IMMUTABLE_NAMESPACE, SIGNED_NAMESPACE,
};

fn testnet(count: usize) -> Testnet {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let testnet = Testnet::new(count).expect("testnet spawns");

    for node in &testnet.nodes[1..] {
        assert!(node.bootstrapped().expect("node is running"));
    }

    testnet
}

#[test]
fn put_and_get_an_immutable_record() {
    let testnet = testnet(8);

    let value = Bytes::from_static(b"immutable value");
    let key = immutable_key(&value);

    let stored_at = testnet.nodes[2]
        .put_record(Record::new(&key, value.clone()))
        .expect("node is running");
    assert!(stored_at > 0);

    let found = testnet.nodes[6]
        .get_record(&key)
        .expect("node is running")
        .next()
        .expect("record is found");

    assert_eq!(found.value, value);
}

#[test]
fn a_record_with_a_wrong_key_is_never_stored() {
    let testnet = testnet(4);

    let record = Record::new(b"/immutable/not-the-hash", Bytes::from_static(b"value"));

    let stored_at = testnet.nodes[1]
        .put_record(record)
        .expect("node is running");
    assert_eq!(stored_at, 0);

    assert!(testnet.nodes[2]
        .get_record(b"/immutable/not-the-hash")
        .expect("node is running")
        .next()
        .is_none());
}

#[test]
fn higher_sequence_numbers_supersede() {
    let testnet = testnet(8);

    let signer = SigningKey::from_bytes(&[1_u8; 32]);
    let first = SignedRecord::sign(&signer, "first version", 1);
    let second = SignedRecord::sign(&signer, "second version", 2);

    assert!(testnet.nodes[1]
        .put_record(first.to_record())
        .expect("node is running") > 0);
    assert!(testnet.nodes[2]
        .put_record(second.to_record())
        .expect("node is running") > 0);

    let found = testnet.nodes[5]
        .get_record(&second.key())
        .expect("node is running")
        .next()
        .expect("record is found");

    let signed = SignedRecord::from_record(&found).expect("record verifies");
    assert_eq!(signed.seq(), 2);
    assert_eq!(signed.payload().as_ref(), b"second version");
}

#[test]
fn provide_and_find_providers() {
    let testnet = testnet(8);

    let key = b"/immutable/swarm";

    assert!(testnet.nodes[1].provide(key).expect("node is running") > 0);
    assert!(testnet.nodes[2].provide(key).expect("node is running") > 0);

    let provider_ids = testnet.nodes[6]
        .find_providers(key, None)
        .expect("node is running")
        .map(|node| *node.id())
        .collect::<HashSet<_>>();

    let first = *testnet.nodes[1].info().expect("node is running").id();
    let second = *testnet.nodes[2].info().expect("node is running").id();

    assert!(provider_ids.contains(&first));
    assert!(provider_ids.contains(&second));
}

#[test]
fn find_providers_stops_at_the_limit() {
    let testnet = testnet(6);

    let key = b"/immutable/swarm";

    for node in &testnet.nodes[1..4] {
        assert!(node.provide(key).expect("node is running") > 0);
    }

    let limited = testnet.nodes[5]
        .find_providers(key, Some(1))
        .expect("node is running")
        .collect::<Vec<_>>();

    assert_eq!(limited.len(), 1);
}

#[test]
fn find_peer() {
    let testnet = testnet(8);

    let target = *testnet.nodes[5].info().expect("node is running").id();

    let found = testnet.nodes[2]
        .find_peer(target)
        .expect("node is running")
        .expect("peer is found");
    assert_eq!(found.id(), &target);

    assert_eq!(
        testnet.nodes[2].find_peer(Id::random()).expect("node is running"),
        None
    );
}

#[test]
fn reprovider_reannounces_before_expiry() {
    let testnet = testnet(4);

    let node = Dht::with_config(Config {
        bootstrap: testnet.bootstrap.clone(),
        wire: Some(Box::new(testnet.hub.bind())),
        reprovide_interval: Duration::from_millis(200),
        // Larger than the validity, so records are always due.
        reprovide_threshold: Duration::from_secs(48 * 60 * 60),
        ..Config::default()
    })
    .expect("node spawns");
    assert!(node.bootstrapped().expect("node is running"));

    let events = node.subscribe_reprovide().expect("node is running");

    assert!(node.provide(b"/immutable/reprovided").expect("node is running") > 0);

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut reannounced = false;

    while Instant::now() < deadline {
        if let Ok(ReprovideEvent::CycleDone { announced }) =
            events.recv_timeout(Duration::from_millis(500))
        {
            if announced > 0 {
                reannounced = true;
                break;
            }
        }
    }

    assert!(reannounced);
}

#[test]
fn stopped_providing_keys_are_not_reannounced() {
    let testnet = testnet(4);

    let node = Dht::with_config(Config {
        bootstrap: testnet.bootstrap.clone(),
        wire: Some(Box::new(testnet.hub.bind())),
        reprovide_interval: Duration::from_millis(100),
        reprovide_threshold: Duration::from_secs(48 * 60 * 60),
        ..Config::default()
    })
    .expect("node spawns");
    assert!(node.bootstrapped().expect("node is running"));

    assert!(node.provide(b"/immutable/withdrawn").expect("node is running") > 0);
    node.stop_providing(b"/immutable/withdrawn")
        .expect("node is running");

    let events = node.subscribe_reprovide().expect("node is running");

    // With a threshold larger than the validity every kept self record is
    // due each cycle, so an empty cycle proves the record is gone.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut saw_empty_cycle = false;

    while Instant::now() < deadline {
        if let Ok(ReprovideEvent::CycleStarted { due }) =
            events.recv_timeout(Duration::from_millis(500))
        {
            if due == 0 {
                saw_empty_cycle = true;
                break;
            }
        }
    }

    assert!(saw_empty_cycle);
}

#[test]
fn built_in_validators_can_be_registered_directly() {
    let mut validators = ValidatorRegistry::empty();
    validators.register(IMMUTABLE_NAMESPACE, Box::new(ImmutableValidator));
    validators.register(SIGNED_NAMESPACE, Box::new(SignedRecordValidator));

    let value = Bytes::from_static(b"hand built registry");
    let key = immutable_key(&value);

    assert!(validators.validate(&key, &Record::new(&key, value)).is_ok());
}

#[test]
fn id_parse_errors_are_recoverable() {
    assert_eq!("abcd".parse::<Id>(), Err(InvalidIdSize(2)));
    assert!("€a".parse::<Id>().is_err());
}

#[test]
fn cancellation_ends_a_stalled_query() {
    let hub = MemoryHub::new();

    // The only known peer never answers.
    let node = Dht::with_config(Config {
        bootstrap: vec!["127.0.0.1:9".to_string()],
        wire: Some(Box::new(hub.bind())),
        ..Config::default()
    })
    .expect("node spawns");

    let cancellation = Cancellation::new();
    let mut response = node
        .get_record_with(
            b"/immutable/missing",
            QueryOptions {
                cancellation: Some(cancellation.clone()),
                ..QueryOptions::default()
            },
        )
        .expect("node is running");

    cancellation.cancel();

    let started = Instant::now();
    assert_eq!(response.next(), None);
    // Well before the 2 second request timeout.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn a_deadline_ends_a_stalled_query() {
    let hub = MemoryHub::new();

    let node = Dht::with_config(Config {
        bootstrap: vec!["127.0.0.1:9".to_string()],
        wire: Some(Box::new(hub.bind())),
        ..Config::default()
    })
    .expect("node spawns");

    let started = Instant::now();
    let mut response = node
        .get_record_with(
            b"/immutable/missing",
            QueryOptions {
                timeout: Some(Duration::from_millis(100)),
                ..QueryOptions::default()
            },
        )
        .expect("node is running");

    assert_eq!(response.next(), None);
    assert!(started.elapsed() < Duration::from_secs(1));
}
