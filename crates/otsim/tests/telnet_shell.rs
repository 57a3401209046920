// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telnet shell scenarios: the write command emits Status + Update, the
//! query command reflects bus state.

mod common;

use common::{configure_module, wait_until, TestBus};
use otsim::msgbus::{Envelope, Kind, Point, Pusher, Status, Subscriber, RUNTIME_TOPIC};
use otsim::ModuleRegistry;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

const SHELL_ENDPOINT: &str = "127.0.0.1:18920";

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("telnet", Box::new(otsim::telnet::Factory));
    registry
}

fn connect_shell() -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(SHELL_ENDPOINT) {
            return stream;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    panic!("telnet shell never came up at {SHELL_ENDPOINT}");
}

/// Read lines until one contains `needle` (or panic after `max` lines).
fn read_until(reader: &mut BufReader<TcpStream>, needle: &str, max: usize) -> String {
    for _ in 0..max {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 {
            break;
        }
        if line.contains(needle) {
            return line;
        }
    }

    panic!("never saw '{needle}' in shell output");
}

#[test]
fn shell_write_and_query() {
    let bus = TestBus::start();

    let xml = format!(
        r#"<telnet name="telnet">
             <endpoint>{SHELL_ENDPOINT}</endpoint>
             <banner>test shell</banner>
           </telnet>"#
    );

    let mut module = configure_module(&registry(), "telnet", &xml);
    module.run(&bus.ctx()).expect("telnet module starts");

    let envelopes: Arc<Mutex<Vec<(Kind, String)>>> = Arc::default();
    {
        let mut subscriber = Subscriber::new(&bus.pub_endpoint).with_name("observer");
        let sink = envelopes.clone();
        subscriber.on_status(move |env| {
            if env.status().is_ok() {
                sink.lock().push((Kind::Status, env.sender().to_string()));
            }
        });
        let sink = envelopes.clone();
        subscriber.on_update(move |env| {
            if env.update().is_ok() {
                sink.lock().push((Kind::Update, env.sender().to_string()));
            }
        });
        subscriber
            .start(RUNTIME_TOPIC, bus.shutdown.clone())
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(200));

    let stream = connect_shell();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    read_until(&mut reader, "test shell", 5);

    // write: acknowledged locally, Status + Update on the bus.
    writeln!(writer, "write load 2.5").unwrap();
    writer.flush().unwrap();
    read_until(&mut reader, "wrote load=2.500000", 5);

    assert!(wait_until(Duration::from_secs(5), || {
        let envelopes = envelopes.lock();
        envelopes.contains(&(Kind::Status, "telnet".to_string()))
            && envelopes.contains(&(Kind::Update, "telnet".to_string()))
    }));

    // query: reflects Status from other modules.
    let pusher = Pusher::connect(&bus.pull_endpoint).unwrap();
    let status = Status {
        measurements: vec![Point::new("bus.voltage", 118.0)],
    };
    pusher
        .push(RUNTIME_TOPIC, &Envelope::new("modbus", &status).unwrap())
        .unwrap();

    std::thread::sleep(Duration::from_millis(300));

    writeln!(writer, "query bus.voltage").unwrap();
    writer.flush().unwrap();
    read_until(&mut reader, "bus.voltage = 118.000000", 5);

    // unknown tags are reported, not fatal.
    writeln!(writer, "query nope").unwrap();
    writer.flush().unwrap();
    read_until(&mut reader, "tag nope is unknown", 5);

    writeln!(writer, "exit").unwrap();
    writer.flush().unwrap();
}
