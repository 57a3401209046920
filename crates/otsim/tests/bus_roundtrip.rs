// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end bus tests: envelope round-trips through a live aggregator,
//! ordered fan-out, the sender self-filter, and LOG strings.

mod common;

use common::{wait_until, TestBus};
use otsim::msgbus::{
    Envelope, Point, Pusher, Status, Subscriber, LOG_TOPIC, RUNTIME_TOPIC,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn status_envelope_roundtrip_through_broker() {
    let bus = TestBus::start();

    let received: Arc<Mutex<Vec<(String, Vec<Point>)>>> = Arc::default();

    let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("observer");
    {
        let received = received.clone();
        subscriber.on_status(move |env| {
            if let Ok(status) = env.status() {
                received
                    .lock()
                    .push((env.sender().to_string(), status.measurements));
            }
        });
    }
    subscriber
        .start(RUNTIME_TOPIC, bus.shutdown.clone())
        .unwrap();

    // Give the subscriber a moment to connect before pushing.
    std::thread::sleep(Duration::from_millis(200));

    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    let status = Status {
        measurements: vec![Point::new("bus-692.voltage", 120.5)],
    };
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("modbus", &status).unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !received
        .lock()
        .is_empty()));

    let received = received.lock();
    assert_eq!(received[0].0, "modbus");
    assert_eq!(received[0].1[0].tag, "bus-692.voltage");
    assert_eq!(received[0].1[0].value, 120.5);
}

#[test]
fn subscriber_drops_self_originated_envelopes() {
    let bus = TestBus::start();

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();

    let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("logic");
    {
        let seen = seen.clone();
        subscriber.on_status(move |env| seen.lock().push(env.sender().to_string()));
    }
    subscriber
        .start(RUNTIME_TOPIC, bus.shutdown.clone())
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    let status = Status {
        measurements: vec![Point::new("x", 1.0)],
    };

    // Our own envelope first, then a peer's.
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("logic", &status).unwrap())
        .unwrap();
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("peer", &status).unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !seen.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(200));

    let seen = seen.lock();
    assert_eq!(*seen, vec!["peer".to_string()]);
}

#[test]
fn same_publisher_order_is_preserved() {
    let bus = TestBus::start();

    let values: Arc<Mutex<Vec<f64>>> = Arc::default();

    let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("observer");
    {
        let values = values.clone();
        subscriber.on_status(move |env| {
            if let Ok(status) = env.status() {
                values.lock().extend(status.measurements.iter().map(|p| p.value));
            }
        });
    }
    subscriber
        .start(RUNTIME_TOPIC, bus.shutdown.clone())
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();

    for i in 0..20 {
        let status = Status {
            measurements: vec![Point::new("seq", i as f64)],
        };
        pusher
            .push(RUNTIME_TOPIC, &Envelope::new("seq-source", &status).unwrap())
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || values.lock().len() == 20));

    let values = values.lock();
    let want: Vec<f64> = (0..20).map(|i| i as f64).collect();
    assert_eq!(*values, want);
}

#[test]
fn log_topic_carries_free_form_strings() {
    let bus = TestBus::start();

    let lines: Arc<Mutex<Vec<String>>> = Arc::default();

    let mut subscriber = Subscriber::new(&bus.pub_endpoint);
    {
        let lines = lines.clone();
        subscriber.on_string(move |msg| lines.lock().push(msg.to_string()));
    }
    subscriber.start(LOG_TOPIC, bus.shutdown.clone()).unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    pusher
        .push_string(LOG_TOPIC, "[logic] starting tick loop")
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !lines.lock().is_empty()));
    assert_eq!(lines.lock()[0], "[logic] starting tick loop");
}

#[test]
fn topics_are_isolated() {
    let bus = TestBus::start();

    let runtime_count: Arc<Mutex<usize>> = Arc::default();

    let mut subscriber = Subscriber::new(&bus.pub_endpoint);
    {
        let runtime_count = runtime_count.clone();
        subscriber.on_status(move |_| *runtime_count.lock() += 1);
    }
    subscriber
        .start(RUNTIME_TOPIC, bus.shutdown.clone())
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    let status = Status {
        measurements: vec![Point::new("x", 1.0)],
    };

    // HEALTH traffic must not reach a RUNTIME subscriber.
    pusher
        .push("HEALTH", &Envelope::new("peer", &status).unwrap())
        .unwrap();
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("peer", &status).unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || *runtime_count.lock() > 0));
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(*runtime_count.lock(), 1);
}
