// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared scaffolding for the end-to-end tests: a live bus aggregator on
//! ephemeral ports plus a run context pointed at it.

// Not every test file uses every helper.
#![allow(dead_code)]

use otsim::msgbus::Broker;
use otsim::util::Shutdown;
use otsim::RunContext;
use std::time::{Duration, Instant};

pub struct TestBus {
    pub pub_endpoint: String,
    pub pull_endpoint: String,
    pub shutdown: Shutdown,
}

impl TestBus {
    pub fn start() -> Self {
        let shutdown = Shutdown::new();

        let broker = Broker::start("tcp://127.0.0.1:0", "tcp://127.0.0.1:0", shutdown.clone())
            .expect("broker starts on ephemeral ports");

        Self {
            pub_endpoint: format!("tcp://{}", broker.pub_addr()),
            pull_endpoint: format!("tcp://{}", broker.pull_addr()),
            shutdown,
        }
    }

    pub fn ctx(&self) -> RunContext {
        RunContext {
            shutdown: self.shutdown.clone(),
            pub_endpoint: self.pub_endpoint.clone(),
            pull_endpoint: self.pull_endpoint.clone(),
            config_path: std::path::PathBuf::from("/tmp/test-config.xml"),
            waiter: crossbeam::sync::WaitGroup::new(),
        }
    }
}

impl Drop for TestBus {
    fn drop(&mut self) {
        self.shutdown.trip();
    }
}

/// Poll `check` until it returns true or the deadline passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }

    false
}

/// Configure a module from an XML snippet using its registered factory.
pub fn configure_module(
    registry: &otsim::ModuleRegistry,
    tag: &str,
    xml: &str,
) -> Box<dyn otsim::Module> {
    let doc = roxmltree::Document::parse(xml).expect("test XML parses");
    let node = doc.root_element();

    let factory = registry.get(tag).expect("factory registered");
    let mut module = factory.new_module(node).expect("module builds");
    module.configure(node).expect("module configures");
    module
}
