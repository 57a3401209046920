// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Modbus TCP/RTU: register model, PDU framing, and the server/client
//! modules.
//!
//! The `mode` attribute on the `<modbus>` element selects server or client;
//! both share the typed [`register::Register`] codec.

pub mod bits;
pub mod client;
pub mod pdu;
pub mod register;
pub mod server;

use crate::error::ConfigError;
use crate::runtime::{Module, ModuleFactory};

pub use client::ModbusClient;
pub use server::ModbusServer;

/// Factory for the `<modbus>` config element.
pub struct Factory;

impl ModuleFactory for Factory {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        let mode = node.attribute("mode").unwrap_or("server");

        match mode.to_ascii_lowercase().as_str() {
            "server" => {
                let name = node.attribute("name").unwrap_or("modbus");
                Ok(Box::new(ModbusServer::new(name)))
            }
            "client" => {
                let name = node.attribute("name").unwrap_or("modbus-client");
                Ok(Box::new(ModbusClient::new(name)))
            }
            other => Err(ConfigError::invalid(
                "modbus/@mode",
                other,
                "must be server or client",
            )),
        }
    }
}
