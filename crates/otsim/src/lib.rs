// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OT device simulator runtime.
//!
//! A simulator instance is a set of protocol modules composed around a
//! shared message bus:
//!
//! - [`msgbus`]: typed publish/subscribe envelopes over broker-less
//!   pub/pull TCP endpoints
//! - [`modbus`] / [`sunspec`]: register-level protocol servers and clients
//! - [`mqtt`]: broker, client, and device-to-device intercom
//! - [`logic`]: periodic expression evaluator
//! - [`cpu`]: host module (aggregator, supervisor, admin surface)
//! - [`runtime`] / [`config`]: XML-driven module lifecycle
//!
//! Each module binary registers the factories it hosts and calls [`run`]
//! with the config path.

pub mod config;
pub mod control;
pub mod cpu;
pub mod error;
pub mod logic;
pub mod modbus;
pub mod mqtt;
pub mod msgbus;
pub mod runtime;
pub mod sunspec;
pub mod tags;
pub mod telnet;
pub mod transport;
pub mod util;

pub use error::{ConfigError, RuntimeError, EXIT_NO_RESTART};
pub use runtime::{Module, ModuleFactory, ModuleRegistry, RunContext};

use crate::config::Config;
use crate::util::Shutdown;
use std::path::Path;

/// Shared entry point for the module binaries: parse the config, start
/// every registered module, and wait for SIGTERM/SIGINT.
///
/// Returns the process exit code: 0 on a clean shutdown, 101 for
/// configuration errors (do not restart), the failing module's requested
/// code otherwise.
pub fn run(config_path: &Path, registry: &ModuleRegistry) -> i32 {
    let config = match Config::parse(config_path, registry) {
        Ok(config) => config,
        Err(e) => {
            log::error!("parsing config file: {e}");
            return EXIT_NO_RESTART;
        }
    };

    let shutdown = match Shutdown::from_signals() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            log::error!("installing signal handler: {e}");
            return 1;
        }
    };

    let waiter = crossbeam::sync::WaitGroup::new();

    let ctx = RunContext {
        shutdown: shutdown.clone(),
        pub_endpoint: config.pub_endpoint.clone(),
        pull_endpoint: config.pull_endpoint.clone(),
        config_path: config_path.to_path_buf(),
        waiter: waiter.clone(),
    };

    let mut modules = config.modules;

    if let Err(e) = runtime::start(&mut modules, &ctx) {
        log::error!("starting modules: {e}");
        shutdown.trip();
        return e.exit_code();
    }

    shutdown.wait();

    // Wait for every long-lived module thread (including child-process
    // supervision, which may spend up to the SIGKILL grace period).
    drop(ctx);
    drop(modules);
    waiter.wait();

    0
}
