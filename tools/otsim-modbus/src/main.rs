// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Modbus module host: serves or polls Modbus TCP/RTU registers bound to
//! bus tags.

use clap::Parser;
use otsim::ModuleRegistry;
use std::path::PathBuf;

/// OT-sim Modbus module
#[derive(Parser, Debug)]
#[command(name = "ot-sim-modbus-module")]
#[command(about = "OT-sim Modbus module")]
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
    registry.register("modbus", Box::new(otsim::modbus::Factory));

    std::process::exit(otsim::run(&args.config, &registry));
}
