// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded MQTT broker module.
//!
//! Hosts local MQTT listeners and bridges configured topics to bus tags:
//! an external publish on a bridged topic (payload: the text encoding of a
//! float) becomes a Status envelope on RUNTIME, and Update envelopes for
//! bridged tags are republished to their topic.

use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{Envelope, Point, Pusher, Status, Subscriber, RUNTIME_TOPIC};
use crate::runtime::{Module, RunContext};
use crossbeam::channel::{unbounded, Receiver};
use parking_lot::Mutex;
use rumqttd::{Broker, Config, Notification};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// A local listener address with optional TLS material.
#[derive(Debug, Clone, Default)]
struct Listener {
    address: String,
    ca_path: Option<String>,
    cert_path: Option<String>,
    key_path: Option<String>,
}

pub struct MqttBroker {
    name: String,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    listeners: Vec<Listener>,

    topic_to_tag: HashMap<String, String>,
    tag_to_topic: HashMap<String, String>,
}

impl MqttBroker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pub_endpoint: None,
            pull_endpoint: None,
            listeners: Vec::new(),
            topic_to_tag: HashMap::new(),
            tag_to_topic: HashMap::new(),
        }
    }

    fn configure_endpoint(&mut self, node: xml::Node) {
        let mut listener = Listener::default();

        if xml::children(node).next().is_none() {
            listener.address = xml::text(node).to_string();
        } else {
            for child in xml::children(node) {
                match child.tag_name().name() {
                    "address" => listener.address = xml::text(child).to_string(),
                    "tls" => {
                        for tls in xml::children(child) {
                            let text = xml::text(tls).to_string();
                            match tls.tag_name().name() {
                                "ca" => listener.ca_path = Some(text),
                                "key" => listener.key_path = Some(text),
                                "certificate" => listener.cert_path = Some(text),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.listeners.push(listener);
    }

    /// Build the embedded broker's configuration from the listener list.
    fn broker_config(&self) -> Result<Config, RuntimeError> {
        let mut v4 = serde_json::Map::new();

        for (idx, listener) in self.listeners.iter().enumerate() {
            let mut settings = json!({
                "name": format!("v4-{idx}"),
                "listen": listener.address,
                "next_connection_delay_ms": 1,
                "connections": {
                    "connection_timeout_ms": 60000,
                    "max_payload_size": 20480,
                    "max_inflight_count": 100,
                    "dynamic_filters": true,
                },
            });

            if let (Some(cert), Some(key)) = (&listener.cert_path, &listener.key_path) {
                settings["tls"] = json!({
                    "capath": listener.ca_path,
                    "certpath": cert,
                    "keypath": key,
                });
            }

            v4.insert(format!("{}", idx + 1), settings);
        }

        let config = json!({
            "id": 0,
            "router": {
                "max_connections": 10010,
                "max_outgoing_packet_count": 200,
                "max_segment_size": 104857600,
                "max_segment_count": 10,
            },
            "v4": v4,
        });

        serde_json::from_value(config).map_err(|e| RuntimeError::StartFailed {
            module: self.name.clone(),
            reason: format!("building broker config: {e}"),
        })
    }
}

impl Module for MqttBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.configure_endpoint(child),
                "topic" => {
                    let topic = xml::text(child).to_string();
                    let tag = child
                        .attribute("tag")
                        .map(String::from)
                        .unwrap_or_else(|| topic.replace('/', "."));

                    self.topic_to_tag.insert(topic.clone(), tag.clone());
                    self.tag_to_topic.insert(tag, topic);
                }
                _ => {}
            }
        }

        if self.listeners.is_empty() {
            return Err(ConfigError::MissingElement {
                module: self.name.clone(),
                element: "endpoint".into(),
            });
        }

        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);

        let pusher = Pusher::connect(pull_endpoint)?;

        let config = self.broker_config()?;
        let mut broker = Broker::new(config);

        let (mut link_tx, mut link_rx) =
            broker.link("otsim-bus-bridge").map_err(|e| RuntimeError::StartFailed {
                module: self.name.clone(),
                reason: format!("linking into embedded broker: {e}"),
            })?;

        std::thread::Builder::new()
            .name(format!("mqtt-broker-{}", self.name))
            .spawn(move || {
                if let Err(e) = broker.start() {
                    log::error!("[mqtt-broker] broker stopped: {e}");
                }
            })
            .map_err(RuntimeError::Io)?;

        link_tx.subscribe("#").map_err(|e| RuntimeError::StartFailed {
            module: self.name.clone(),
            reason: format!("subscribing to local topics: {e}"),
        })?;

        // Republished values, used to drop the echo of our own publishes.
        let last_out: Arc<Mutex<HashMap<String, String>>> = Arc::default();
        let (repub_tx, repub_rx): (_, Receiver<(String, String)>) = unbounded();

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(&self.name);
        {
            let name = self.name.clone();
            let tag_to_topic = self.tag_to_topic.clone();
            let last_out = last_out.clone();
            subscriber.on_update(move |env| match env.update() {
                Ok(update) => {
                    for point in update.updates {
                        let Some(topic) = tag_to_topic.get(&point.tag) else {
                            continue;
                        };

                        let payload = format!("{}", point.value);
                        last_out.lock().insert(topic.clone(), payload.clone());

                        if repub_tx.send((topic.clone(), payload)).is_err() {
                            return;
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

        // Outbound: bus Updates for bridged tags go back onto their topic.
        {
            let name = self.name.clone();
            let shutdown = ctx.shutdown.clone();

            std::thread::Builder::new()
                .name(format!("mqtt-repub-{}", self.name))
                .spawn(move || loop {
                    crossbeam::select! {
                        recv(shutdown.channel()) -> _ => return,
                        recv(repub_rx) -> msg => {
                            let Ok((topic, payload)) = msg else { return };

                            log::debug!("[{name}] republishing {topic} --> {payload}");
                            if let Err(e) = link_tx.publish(topic, payload.into_bytes()) {
                                log::error!("[{name}] republishing to local broker: {e}");
                            }
                        }
                    }
                })
                .map_err(RuntimeError::Io)?;
        }

        // Inbound: external publishes on bridged topics become Status
        // envelopes.
        let name = self.name.clone();
        let topic_to_tag = self.topic_to_tag.clone();
        let shutdown = ctx.shutdown.clone();

        std::thread::Builder::new()
            .name(format!("mqtt-bridge-{}", self.name))
            .spawn(move || {
                while !shutdown.is_tripped() {
                    let notification = match link_rx.recv() {
                        Ok(Some(notification)) => notification,
                        Ok(None) => continue,
                        Err(e) => {
                            log::error!("[{name}] local broker link closed: {e}");
                            return;
                        }
                    };

                    let Notification::Forward(forward) = notification else {
                        continue;
                    };

                    let topic = String::from_utf8_lossy(&forward.publish.topic).to_string();
                    let payload = String::from_utf8_lossy(&forward.publish.payload).to_string();

                    let Some(tag) = topic_to_tag.get(&topic) else {
                        continue;
                    };

                    // Skip the echo of a value we just republished.
                    if last_out.lock().remove(&topic).as_deref() == Some(payload.as_str()) {
                        continue;
                    }

                    let Ok(value) = payload.trim().parse::<f64>() else {
                        log::warn!("[{name}] non-numeric payload on bridged topic {topic}");
                        continue;
                    };

                    let status = Status {
                        measurements: vec![Point::new(tag, value)],
                    };

                    match Envelope::new(&name, &status) {
                        Ok(env) => {
                            if let Err(e) = pusher.push(RUNTIME_TOPIC, &env) {
                                log::error!("[{name}] sending status message: {e}");
                            }
                        }
                        Err(e) => log::error!("[{name}] creating status message: {e}"),
                    }
                }
            })
            .map_err(RuntimeError::Io)?;

        Ok(())
    }
}
