// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end logic engine scenarios: a tick publishes bound variables as
//! Status, changed variables as Update, and incoming Status feeds bound
//! variables.

mod common;

use common::{configure_module, wait_until, TestBus};
use otsim::msgbus::{Envelope, Point, Pusher, Status, Subscriber, RUNTIME_TOPIC};
use otsim::ModuleRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("logic", Box::new(otsim::logic::Factory));
    registry
}

#[test]
fn tick_publishes_bound_variables() {
    let bus = TestBus::start();

    // After one tick: x = y + 1 = 3, published as tag x.out.
    let xml = r#"<logic name="logic">
                   <period>100ms</period>
                   <program>
                     x = y + 1
                   </program>
                   <variables>
                     <x tag="x.out">0</x>
                     <y>2</y>
                   </variables>
                 </logic>"#;

    let statuses: Arc<Mutex<Vec<Point>>> = Arc::default();
    let updates: Arc<Mutex<Vec<Point>>> = Arc::default();
    {
        let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("observer");
        let statuses = statuses.clone();
        let updates = updates.clone();
        subscriber.on_status(move |env| {
            if let Ok(status) = env.status() {
                statuses.lock().extend(status.measurements);
            }
        });
        subscriber.on_update(move |env| {
            if let Ok(update) = env.update() {
                updates.lock().extend(update.updates);
            }
        });
        subscriber
            .start(RUNTIME_TOPIC, bus.shutdown.clone())
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(200));

    let mut module = configure_module(&registry(), "logic", xml);
    module.run(&bus.ctx()).expect("logic module starts");

    // S4: a Status with x.out = 3.0 appears.
    assert!(wait_until(Duration::from_secs(5), || {
        statuses
            .lock()
            .iter()
            .any(|p| p.tag == "x.out" && p.value == 3.0)
    }));

    // The first tick changed x, so an Update carries it too.
    assert!(wait_until(Duration::from_secs(5), || {
        updates
            .lock()
            .iter()
            .any(|p| p.tag == "x.out" && p.value == 3.0)
    }));
}

#[test]
fn incoming_status_drives_bound_variables() {
    let bus = TestBus::start();

    let xml = r#"<logic name="logic">
                   <period>100ms</period>
                   <program>
                     doubled = source * 2.0
                   </program>
                   <variables>
                     <source tag="ext.value">0</source>
                     <doubled tag="ext.doubled">0</doubled>
                   </variables>
                 </logic>"#;

    let statuses: Arc<Mutex<Vec<Point>>> = Arc::default();
    {
        let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("observer");
        let statuses = statuses.clone();
        subscriber.on_status(move |env| {
            if let Ok(status) = env.status() {
                statuses.lock().extend(status.measurements);
            }
        });
        subscriber
            .start(RUNTIME_TOPIC, bus.shutdown.clone())
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(200));

    let mut module = configure_module(&registry(), "logic", xml);
    module.run(&bus.ctx()).expect("logic module starts");

    std::thread::sleep(Duration::from_millis(300));

    // Feed the bound input from another sender.
    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    let status = Status {
        measurements: vec![Point::new("ext.value", 21.0)],
    };
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("feeder", &status).unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        statuses
            .lock()
            .iter()
            .any(|p| p.tag == "ext.doubled" && p.value == 42.0)
    }));
}
