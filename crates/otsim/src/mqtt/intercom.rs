// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-to-device intercom bridge.
//!
//! Gossips local RUNTIME Status and Update envelopes to a shared MQTT
//! broker on `devices/{self}/status` and `devices/{self}/update` with JSON
//! payloads, and applies messages published by other devices onto the
//! local bus. Messages under our own device name are dropped, and imports
//! are pushed with this module as the sender, so the subscriber self-filter
//! stops re-export loops.

use super::types::Endpoint;
use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{Envelope, Pusher, Status, Subscriber, Update, RUNTIME_TOPIC};
use crate::runtime::{Module, RunContext};
use crossbeam::channel::unbounded;
use rumqttc::{Event, Packet, QoS};
use std::time::Duration;

pub struct Intercom {
    name: String,
    /// Device name on the shared broker; defaults to the module name.
    device: String,
    endpoint: Endpoint,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,
}

impl Intercom {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            device: name.to_string(),
            endpoint: Endpoint::default(),
            pub_endpoint: None,
            pull_endpoint: None,
        }
    }

    fn status_topic(&self) -> String {
        format!("devices/{}/status", self.device)
    }

    fn update_topic(&self) -> String {
        format!("devices/{}/update", self.device)
    }
}

impl Module for Intercom {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.endpoint.url = xml::text(child).to_string(),
                "device" => self.device = xml::text(child).to_string(),
                _ => {}
            }
        }

        if self.endpoint.url.is_empty() {
            return Err(ConfigError::MissingElement {
                module: self.name.clone(),
                element: "endpoint".into(),
            });
        }

        self.endpoint.validate()
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);

        let pusher = Pusher::connect(pull_endpoint)?;

        let mut opts =
            rumqttc::MqttOptions::new(&self.device, &self.endpoint.host, self.endpoint.port);
        opts.set_keep_alive(Duration::from_secs(5));

        let (client, mut connection) = rumqttc::Client::new(opts, 16);

        // Local envelopes destined for the shared broker.
        let (out_tx, out_rx) = unbounded::<(String, Vec<u8>)>();

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(&self.name);
        {
            let name = self.name.clone();
            let topic = self.status_topic();
            let out_tx = out_tx.clone();
            subscriber.on_status(move |env| match env.status() {
                Ok(status) => {
                    if let Ok(payload) = serde_json::to_vec(&status) {
                        if out_tx.send((topic.clone(), payload)).is_err() {
                            log::error!("[{name}] intercom channel closed");
                        }
                    }
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting status message from envelope: {e}"),
            });
        }
        {
            let name = self.name.clone();
            let topic = self.update_topic();
            subscriber.on_update(move |env| match env.update() {
                Ok(update) => {
                    if let Ok(payload) = serde_json::to_vec(&update) {
                        if out_tx.send((topic.clone(), payload)).is_err() {
                            log::error!("[{name}] intercom channel closed");
                        }
                    }
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting update message from envelope: {e}"),
            });
        }
        subscriber
            .start(RUNTIME_TOPIC, ctx.shutdown.clone())
            .map_err(RuntimeError::Io)?;

        // Outbound publisher.
        {
            let name = self.name.clone();
            let publisher = client.clone();
            let shutdown = ctx.shutdown.clone();
            std::thread::Builder::new()
                .name(format!("intercom-pub-{name}"))
                .spawn(move || loop {
                    crossbeam::select! {
                        recv(shutdown.channel()) -> _ => {
                            let _ = publisher.disconnect();
                            return;
                        }
                        recv(out_rx) -> msg => {
                            let Ok((topic, payload)) = msg else { return };
                            if let Err(e) = publisher.publish(topic, QoS::AtMostOnce, false, payload) {
                                log::error!("[{name}] publishing to intercom broker: {e}");
                            }
                        }
                    }
                })
                .map_err(RuntimeError::Io)?;
        }

        if let Err(e) = client.subscribe("devices/+/status", QoS::AtMostOnce) {
            log::error!("[{}] subscribing to device statuses: {e}", self.name);
        }
        if let Err(e) = client.subscribe("devices/+/update", QoS::AtMostOnce) {
            log::error!("[{}] subscribing to device updates: {e}", self.name);
        }

        // Inbound: apply other devices' gossip onto the local bus.
        let name = self.name.clone();
        let device = self.device.clone();
        let shutdown = ctx.shutdown.clone();

        std::thread::Builder::new()
            .name(format!("intercom-sub-{name}"))
            .spawn(move || {
                for event in connection.iter() {
                    if shutdown.is_tripped() {
                        return;
                    }

                    let publish = match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => publish,
                        Ok(_) => continue,
                        Err(e) => {
                            log::error!("[{name}] intercom connection error: {e}");
                            shutdown.wait_timeout(Duration::from_secs(1));
                            continue;
                        }
                    };

                    let topic = publish.topic.clone();
                    let mut parts = topic.split('/');

                    let (Some("devices"), Some(peer), Some(kind)) =
                        (parts.next(), parts.next(), parts.next())
                    else {
                        continue;
                    };

                    // Our own gossip comes back from the broker; drop it.
                    if peer == device {
                        continue;
                    }

                    let env = match kind {
                        "status" => serde_json::from_slice::<Status>(&publish.payload)
                            .map_err(|e| e.to_string())
                            .and_then(|status| {
                                Envelope::new(&name, &status).map_err(|e| e.to_string())
                            }),
                        "update" => serde_json::from_slice::<Update>(&publish.payload)
                            .map_err(|e| e.to_string())
                            .and_then(|update| {
                                Envelope::new(&name, &update).map_err(|e| e.to_string())
                            }),
                        _ => continue,
                    };

                    match env {
                        Ok(env) => {
                            if let Err(e) = pusher.push(RUNTIME_TOPIC, &env) {
                                log::error!("[{name}] pushing gossip from {peer}: {e}");
                            }
                        }
                        Err(e) => {
                            log::error!("[{name}] decoding gossip from {peer}: {e}");
                        }
                    }
                }
            })
            .map_err(RuntimeError::Io)?;

        Ok(())
    }
}
