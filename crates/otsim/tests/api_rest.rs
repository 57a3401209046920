// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end admin surface scenarios: a REST write emits one Status and
//! one Update on RUNTIME, queries reflect the Status-fed snapshot, and
//! module operations answer over the control flow.
//!
//! The CPU module hosts the bus aggregator itself, so this test gives it
//! fixed ports and connects the observer to them.

mod common;

use common::{configure_module, wait_until};
use otsim::msgbus::{Envelope, Kind, Point, Pusher, Status, Subscriber, RUNTIME_TOPIC};
use otsim::util::Shutdown;
use otsim::{ModuleRegistry, RunContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const API_ENDPOINT: &str = "127.0.0.1:18901";
const PUB_ENDPOINT: &str = "tcp://127.0.0.1:18902";
const PULL_ENDPOINT: &str = "tcp://127.0.0.1:18903";

fn api_url(path: &str) -> String {
    format!("http://{API_ENDPOINT}{path}")
}

#[test]
fn rest_surface_end_to_end() {
    let shutdown = Shutdown::new();

    let ctx = RunContext {
        shutdown: shutdown.clone(),
        pub_endpoint: PUB_ENDPOINT.to_string(),
        pull_endpoint: PULL_ENDPOINT.to_string(),
        config_path: std::path::PathBuf::from("/tmp/test-config.xml"),
        waiter: crossbeam::sync::WaitGroup::new(),
    };

    let mut registry = ModuleRegistry::new();
    registry.register("cpu", Box::new(otsim::cpu::Factory));

    let xml = format!(
        r#"<cpu name="cpu">
             <api>
               <endpoint>{API_ENDPOINT}</endpoint>
             </api>
           </cpu>"#
    );

    let mut module = configure_module(&registry, "cpu", &xml);
    module.run(&ctx).expect("cpu module starts");

    // Observe RUNTIME through the CPU's aggregator.
    let envelopes: Arc<Mutex<Vec<(Kind, String, Vec<Point>)>>> = Arc::default();
    {
        let mut subscriber = Subscriber::new(PUB_ENDPOINT).with_name("observer");
        let sink = envelopes.clone();
        subscriber.on_status(move |env| {
            if let Ok(status) = env.status() {
                sink.lock()
                    .push((Kind::Status, env.sender().to_string(), status.measurements));
            }
        });
        let sink = envelopes.clone();
        subscriber.on_update(move |env| {
            if let Ok(update) = env.update() {
                sink.lock()
                    .push((Kind::Update, env.sender().to_string(), update.updates));
            }
        });
        subscriber.start(RUNTIME_TOPIC, shutdown.clone()).unwrap();
    }

    let client = reqwest::blocking::Client::new();

    // Wait for the API to come up.
    assert!(wait_until(Duration::from_secs(10), || {
        client.get(api_url("/api/v1/query")).send().is_ok()
    }));
    std::thread::sleep(Duration::from_millis(200));

    // S6: POST write emits one Status and one Update, sender cpu-api.
    let resp = client
        .post(api_url("/api/v1/write/load/3.5"))
        .send()
        .unwrap();
    assert!(resp.status().is_success());

    assert!(wait_until(Duration::from_secs(5), || {
        let envelopes = envelopes.lock();
        let status = envelopes.iter().any(|(kind, sender, points)| {
            *kind == Kind::Status
                && sender == "cpu-api"
                && points.iter().any(|p| p.tag == "load" && p.value == 3.5)
        });
        let update = envelopes.iter().any(|(kind, sender, points)| {
            *kind == Kind::Update
                && sender == "cpu-api"
                && points.iter().any(|p| p.tag == "load" && p.value == 3.5)
        });
        status && update
    }));

    // Bad value is a 4xx.
    let resp = client
        .post(api_url("/api/v1/write/load/not-a-number"))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // A Status from another module lands in the query snapshot.
    let pusher = Pusher::connect(PULL_ENDPOINT).unwrap();
    let status = Status {
        measurements: vec![Point::new("sw.breaker", 1.0)],
    };
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("modbus", &status).unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        client
            .get(api_url("/api/v1/query/sw.breaker"))
            .send()
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }));

    let point: serde_json::Value = client
        .get(api_url("/api/v1/query/sw.breaker"))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(point["value"], 1.0);

    // Unknown tag is a 4xx.
    let resp = client.get(api_url("/api/v1/query/nope")).send().unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Module list flows through ModuleControl/Confirmation (no modules
    // configured, so the table is empty but the reply arrives).
    let resp = client.get(api_url("/api/v1/modules")).send().unwrap();
    assert!(resp.status().is_success());

    // Unknown module enable is a 4xx with a textual reason.
    let resp = client
        .post(api_url("/api/v1/modules/missing"))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(resp.text().unwrap(), "does not exist");

    // Prometheus endpoint serves text.
    let resp = client.get(api_url("/metrics")).send().unwrap();
    assert!(resp.status().is_success());

    shutdown.trip();
}
