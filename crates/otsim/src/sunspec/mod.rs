// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SunSpec model engine and server/client modules.
//!
//! SunSpec layers on the Modbus holding-register space starting at 40000:
//! the "SunS" identifier, a chain of `(id, length, data)` models described
//! by embedded JSON schemas, and a `(65535, 0)` end marker.

pub mod client;
pub mod register;
pub mod schema;
pub mod server;

use crate::error::ConfigError;
use crate::runtime::{Module, ModuleFactory};

pub use client::SunSpecClient;
pub use register::{SsRegister, SunSpecError, SunSpecType};
pub use schema::{END_MODEL_ID, SUNSPEC_BASE_ADDR, SUNSPEC_IDENTIFIER};
pub use server::SunSpecServer;

/// Factory for the `<sunspec>` config element.
pub struct Factory;

impl ModuleFactory for Factory {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        let mode = node.attribute("mode").unwrap_or("server");

        match mode.to_ascii_lowercase().as_str() {
            "server" => {
                let name = node.attribute("name").unwrap_or("sunspec");
                Ok(Box::new(SunSpecServer::new(name)))
            }
            "client" => {
                let name = node.attribute("name").unwrap_or("sunspec-client");
                Ok(Box::new(SunSpecClient::new(name)))
            }
            other => Err(ConfigError::invalid(
                "sunspec/@mode",
                other,
                "must be server or client",
            )),
        }
    }
}
