// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end SunSpec scenarios: the well-known identifier, the model
//! chain walk, scale-factor resolution, and tag-bound writes.

mod common;

use common::{configure_module, wait_until, TestBus};
use otsim::modbus::pdu::{Client, TcpTransport};
use otsim::msgbus::{Envelope, Point, Pusher, Status, Subscriber, RUNTIME_TOPIC};
use otsim::sunspec::END_MODEL_ID;
use otsim::ModuleRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const SERVER_ENDPOINT: &str = "127.0.0.1:18510";

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("sunspec", Box::new(otsim::sunspec::Factory));
    registry
}

fn start_server(bus: &TestBus) {
    let xml = format!(
        r#"<sunspec mode="server" name="inverter">
             <endpoint>{SERVER_ENDPOINT}</endpoint>
             <model id="1">
               <point name="Mn">naskel</point>
               <point name="Md">ot-sim</point>
               <point name="SN">0042</point>
             </model>
             <model id="103">
               <point name="W" tag="inv.power"/>
               <point name="W_SF">1</point>
               <point name="A">12</point>
               <point name="A_SF">-1</point>
             </model>
           </sunspec>"#
    );

    let mut module = configure_module(&registry(), "sunspec", &xml);
    module.run(&bus.ctx()).expect("sunspec server starts");
}

fn connect() -> Client {
    let addr = SERVER_ENDPOINT.parse().unwrap();

    for _ in 0..50 {
        if let Ok(transport) = TcpTransport::connect(addr, 1, Duration::from_secs(5)) {
            return Client::new(Box::new(transport));
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    panic!("sunspec server never came up at {SERVER_ENDPOINT}");
}

#[test]
fn sunspec_end_to_end() {
    let bus = TestBus::start();
    start_server(&bus);

    std::thread::sleep(Duration::from_millis(200));
    let mut client = connect();

    // S3: the identifier at 40000-40001 spells "SunS".
    let data = client.read_holding_registers(40000, 2).unwrap();
    assert_eq!(data, vec![0x53, 0x75, 0x6E, 0x53]);
    assert_eq!(
        u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        1_400_204_883
    );

    // Walk the model chain: model 1 (length 66), model 103 (length 50),
    // then the end marker. The walk terminates in as many iterations as
    // there are models.
    let mut addr = 40002u16;
    let mut chain = Vec::new();

    for _ in 0..10 {
        let head = client.read_holding_registers(addr, 2).unwrap();
        let id = u16::from_be_bytes([head[0], head[1]]);
        let length = u16::from_be_bytes([head[2], head[3]]);

        if id == END_MODEL_ID {
            assert_eq!(length, 0);
            break;
        }

        chain.push((id, length));
        addr += 2 + length;
    }

    assert_eq!(chain, vec![(1, 66), (103, 50)]);

    // Model 1 strings serve their configured values, zero-padded.
    // Mn is the first data point, at 40004.
    let mn = client.read_holding_registers(40004, 16).unwrap();
    assert_eq!(&mn[..6], b"naskel");
    assert!(mn[6..].iter().all(|b| *b == 0));

    // Scale factors resolve at read time: A = 12 engineering units at
    // sf -1 serves wire value 120. Model 103 data starts at 40072
    // (40002 + 2 + 66 + 2); A is its first point.
    let a = client.read_holding_registers(40072, 1).unwrap();
    assert_eq!(u16::from_be_bytes([a[0], a[1]]), 120);

    // Tag-bound point: seed inv.power over the bus, read it back through
    // the model. W sits 12 words into model 103's data region, sf = 1.
    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    let status = Status {
        measurements: vec![Point::new("inv.power", 4800.0)],
    };
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("feeder", &status).unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        client
            .read_holding_registers(40072 + 12, 1)
            .map(|data| u16::from_be_bytes([data[0], data[1]]) == 480)
            .unwrap_or(false)
    }));

    // FC16 write to the tag-bound point publishes an Update with the
    // scale factor applied.
    let updates: Arc<Mutex<Vec<Point>>> = Arc::default();
    {
        let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("observer");
        let updates = updates.clone();
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

    // wire 100 at sf 1 = engineering 1000
    client
        .write_multiple_registers(40072 + 12, 1, &100u16.to_be_bytes())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        updates
            .lock()
            .iter()
            .any(|p| p.tag == "inv.power" && p.value == 1000.0)
    }));
}

#[test]
fn model_one_must_come_first() {
    let registry = registry();

    let doc = roxmltree::Document::parse(
        r#"<sunspec mode="server">
             <endpoint>127.0.0.1:18511</endpoint>
             <model id="103"><point name="W">1</point></model>
           </sunspec>"#,
    )
    .unwrap();

    let factory = registry.get("sunspec").unwrap();
    let mut module = factory.new_module(doc.root_element()).unwrap();

    assert!(module.configure(doc.root_element()).is_err());
}
