// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end Modbus server scenarios: coil write visibility, scaled input
//! reads, and gap handling.

mod common;

use common::{configure_module, wait_until, TestBus};
use otsim::modbus::pdu::{Client, ProtocolError, TcpTransport};
use otsim::msgbus::{Envelope, Point, Pusher, Status, Subscriber, RUNTIME_TOPIC};
use otsim::ModuleRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const SERVER_ENDPOINT: &str = "127.0.0.1:18502";

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("modbus", Box::new(otsim::modbus::Factory));
    registry
}

fn start_server(bus: &TestBus) {
    let xml = format!(
        r#"<modbus mode="server" name="mb-server">
             <endpoint>{SERVER_ENDPOINT}</endpoint>
             <register type="coil">
               <address>0</address>
               <tag>sw.breaker</tag>
             </register>
             <register type="input" data-type="uint32">
               <address>10</address>
               <tag>bus.voltage</tag>
               <scaling>2</scaling>
             </register>
             <register type="holding" data-type="uint16">
               <address>20</address>
               <tag>load.setpoint</tag>
             </register>
           </modbus>"#
    );

    let mut module = configure_module(&registry(), "modbus", &xml);
    module.run(&bus.ctx()).expect("modbus server starts");
}

fn connect() -> Client {
    let addr = SERVER_ENDPOINT.parse().unwrap();

    for _ in 0..50 {
        if let Ok(transport) = TcpTransport::connect(addr, 1, Duration::from_secs(5)) {
            return Client::new(Box::new(transport));
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    panic!("modbus server never came up at {SERVER_ENDPOINT}");
}

#[test]
fn modbus_end_to_end() {
    let bus = TestBus::start();
    start_server(&bus);

    // Collect Update envelopes the server publishes for writes.
    let updates: Arc<Mutex<Vec<(String, Vec<Point>)>>> = Arc::default();
    {
        let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("observer");
        let updates = updates.clone();
        subscriber.on_update(move |env| {
            if let Ok(update) = env.update() {
                updates
                    .lock()
                    .push((env.sender().to_string(), update.updates));
            }
        });
        subscriber
            .start(RUNTIME_TOPIC, bus.shutdown.clone())
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(200));
    let mut client = connect();

    // S1: FC5 coil write with 0xFF00 lands as 1.0 and emits an Update.
    client.write_single_coil(0, 0xFF00).unwrap();

    let bits = client.read_coils(0, 1).unwrap();
    assert_eq!(bits[0] & 0x01, 1, "written coil reads back as set");

    assert!(wait_until(Duration::from_secs(5), || !updates.lock().is_empty()));
    {
        let updates = updates.lock();
        assert_eq!(updates[0].0, "mb-server");
        assert_eq!(updates[0].1[0].tag, "sw.breaker");
        assert_eq!(updates[0].1[0].value, 1.0);
    }

    // S2: scaled input read. Seed the tag over the bus, then FC4.
    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    let status = Status {
        measurements: vec![Point::new("bus.voltage", 480.0)],
    };
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("feeder", &status).unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        client
            .read_input_registers(10, 2)
            .map(|data| data == vec![0x00, 0x00, 0xBB, 0x80])
            .unwrap_or(false)
    }));

    // FC6 holding write becomes tag value and an Update.
    client.write_single_register(20, 42).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        updates
            .lock()
            .iter()
            .any(|(_, points)| points.iter().any(|p| p.tag == "load.setpoint" && p.value == 42.0))
    }));

    let data = client.read_holding_registers(20, 1).unwrap();
    assert_eq!(data, vec![0x00, 42]);

    // Reads across unmapped addresses return IllegalDataAddress.
    match client.read_input_registers(100, 1) {
        Err(ProtocolError::Exception { exception, .. }) => {
            assert_eq!(exception, otsim::modbus::pdu::Exception::IllegalDataAddress)
        }
        other => panic!("expected IllegalDataAddress, got {other:?}"),
    }
}
