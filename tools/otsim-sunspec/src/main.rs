// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SunSpec module host: composes or discovers SunSpec models over Modbus
//! holding registers.

use clap::Parser;
use otsim::ModuleRegistry;
use std::path::PathBuf;

/// OT-sim SunSpec module
#[derive(Parser, Debug)]
#[command(name = "ot-sim-sunspec-module")]
#[command(about = "OT-sim SunSpec module")]
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
    registry.register("sunspec", Box::new(otsim::sunspec::Factory));

    std::process::exit(otsim::run(&args.config, &registry));
}
