// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CPU module host: binds the bus, supervises child modules, and serves
//! the admin surface. Also hosts the Telnet shell when configured.

use clap::Parser;
use otsim::ModuleRegistry;
use std::path::PathBuf;

/// OT-sim CPU module
#[derive(Parser, Debug)]
#[command(name = "ot-sim-cpu-module")]
#[command(about = "OT-sim CPU module")]
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
    registry.register("cpu", Box::new(otsim::cpu::Factory));
    registry.register("telnet", Box::new(otsim::telnet::Factory));

    std::process::exit(otsim::run(&args.config, &registry));
}
