// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT modules: broker, client, and the device-to-device intercom.
//!
//! The `mode` attribute on the `<mqtt>` element selects broker or client;
//! the intercom bridge registers under its own `<intercom>` tag.

pub mod broker;
pub mod client;
pub mod intercom;
pub mod types;

use crate::error::ConfigError;
use crate::runtime::{Module, ModuleFactory};

pub use broker::MqttBroker;
pub use client::MqttClient;
pub use intercom::Intercom;

/// Factory for the `<mqtt>` config element.
pub struct Factory;

impl ModuleFactory for Factory {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        let mode = node.attribute("mode").unwrap_or("client");

        match mode.to_ascii_lowercase().as_str() {
            "broker" => {
                let name = node.attribute("name").unwrap_or("mqtt-broker");
                Ok(Box::new(MqttBroker::new(name)))
            }
            "client" => {
                let name = node.attribute("name").unwrap_or("mqtt-client");
                Ok(Box::new(MqttClient::new(name)))
            }
            other => Err(ConfigError::invalid(
                "mqtt/@mode",
                other,
                "must be broker or client",
            )),
        }
    }
}

/// Factory for the `<intercom>` config element.
pub struct IntercomFactory;

impl ModuleFactory for IntercomFactory {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        let name = node.attribute("name").unwrap_or("intercom");
        Ok(Box::new(Intercom::new(name)))
    }
}
