// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT module host: embedded broker, remote-broker client, and the
//! device-to-device intercom bridge.

use clap::Parser;
use otsim::ModuleRegistry;
use std::path::PathBuf;

/// OT-sim MQTT module
#[derive(Parser, Debug)]
#[command(name = "ot-sim-mqtt-module")]
#[command(about = "OT-sim MQTT module")]
#[command(version)]
struct Args {
    /// Path to the XML config file
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let mut registry = ModuleRegistry::new();
    registry.register("mqtt", Box::new(otsim::mqtt::Factory));
    registry.register("intercom", Box::new(otsim::mqtt::IntercomFactory));

    std::process::exit(otsim::run(&args.config, &registry));
}
