// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT client module.
//!
//! Mirrors configured tags to topics on a remote broker. Endpoints are
//! tried in configuration order; a lost connection advances to the next
//! endpoint with exponential backoff (capped at five minutes). Tags publish
//! on a fixed period, or immediately on change when the period is zero.

use super::types::{Endpoint, PayloadData, DEFAULT_PAYLOAD_TEMPLATE};
use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{Subscriber, RUNTIME_TOPIC};
use crate::runtime::{Module, RunContext};
use crossbeam::channel::{unbounded, Receiver};
use parking_lot::RwLock;
use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

pub struct MqttClient {
    name: String,
    id: String,
    period: Duration,

    pub_endpoint: Option<String>,

    endpoints: Vec<Endpoint>,
    /// Index of the endpoint to try next.
    endpoint: usize,

    /// tag -> topic
    topics: HashMap<String, String>,
    /// Latest tag values mirrored from the bus.
    values: Arc<RwLock<HashMap<String, f64>>>,

    payload_template: String,
    timestamp_format: Option<String>,
}

impl MqttClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            id: String::new(),
            period: Duration::from_secs(5),
            pub_endpoint: None,
            endpoints: Vec::new(),
            endpoint: 0,
            topics: HashMap::new(),
            values: Arc::new(RwLock::new(HashMap::new())),
            payload_template: DEFAULT_PAYLOAD_TEMPLATE.to_string(),
            timestamp_format: None,
        }
    }

    fn configure_endpoint(&mut self, node: xml::Node) -> Result<(), ConfigError> {
        let mut endpoint = Endpoint::default();

        if xml::children(node).next().is_none() {
            endpoint.url = xml::text(node).to_string();
        } else {
            for child in xml::children(node) {
                match child.tag_name().name() {
                    "url" => endpoint.url = xml::text(child).to_string(),
                    "tls" => {
                        endpoint.insecure = child
                            .attribute("insecure")
                            .map(|v| v == "true")
                            .unwrap_or(false);

                        for tls in xml::children(child) {
                            let text = xml::text(tls).to_string();
                            match tls.tag_name().name() {
                                "ca" => endpoint.ca_path = Some(text),
                                "key" => endpoint.key_path = Some(text),
                                "certificate" => endpoint.cert_path = Some(text),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Next endpoint in the fallback order, circling back to the start.
    fn next_endpoint(&mut self) -> Endpoint {
        if self.endpoint >= self.endpoints.len() {
            self.endpoint = 0;
        }

        let endpoint = self.endpoints[self.endpoint].clone();
        self.endpoint += 1;
        endpoint
    }

    fn options(&self, endpoint: &Endpoint) -> Result<MqttOptions, std::io::Error> {
        let mut opts = MqttOptions::new(&self.id, &endpoint.host, endpoint.port);
        opts.set_keep_alive(Duration::from_secs(5));
        opts.set_clean_session(true);

        if endpoint.secure() {
            let ca = match &endpoint.ca_path {
                Some(path) => std::fs::read(path)?,
                None => Vec::new(),
            };

            let client_auth = match (&endpoint.cert_path, &endpoint.key_path) {
                (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
                _ => None,
            };

            opts.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        Ok(opts)
    }

    fn publish(&self, client: &rumqttc::Client, tag: &str, value: f64) {
        let Some(topic) = self.topics.get(tag) else {
            return;
        };

        let data = PayloadData::new(&self.id, topic, value, self.timestamp_format.as_deref());
        let payload = data.render(&self.payload_template);

        log::debug!("[{}] publishing {topic} --> {payload} to MQTT broker", self.name);

        if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, payload) {
            log::error!("[{}] publishing topic {topic} to MQTT broker: {e}", self.name);
        }
    }

    /// Connection lifecycle loop: connect to the next endpoint, mirror tags
    /// until the connection drops, back off, repeat.
    fn run_loop(mut self, changed: Receiver<String>, ctx: RunContext) {
        let mut backoff = BACKOFF_INITIAL;

        'reconnect: while !ctx.shutdown.is_tripped() {
            let endpoint = self.next_endpoint();

            let opts = match self.options(&endpoint) {
                Ok(opts) => opts,
                Err(e) => {
                    log::error!(
                        "[{}] loading TLS material for {}: {e}",
                        self.name,
                        endpoint.url
                    );
                    backoff = wait_backoff(&ctx, backoff);
                    continue;
                }
            };

            let (client, mut connection) = rumqttc::Client::new(opts, 16);

            // Drive the protocol loop; surface the first fatal error.
            let (conn_err_tx, conn_err) = unbounded();
            let drive_shutdown = ctx.shutdown.clone();
            let drive = std::thread::Builder::new()
                .name(format!("mqtt-conn-{}", self.name))
                .spawn(move || {
                    for event in connection.iter() {
                        if drive_shutdown.is_tripped() {
                            return;
                        }

                        if let Err(e) = event {
                            let _ = conn_err_tx.send(e);
                            return;
                        }
                    }
                });

            if let Err(e) = drive {
                log::error!("[{}] spawning connection thread: {e}", self.name);
                return;
            }

            log::debug!("[{}] connected to MQTT broker at {}", self.name, endpoint.url);
            backoff = BACKOFF_INITIAL;

            loop {
                crossbeam::select! {
                    recv(ctx.shutdown.channel()) -> _ => {
                        let _ = client.disconnect();
                        return;
                    }
                    recv(conn_err) -> e => {
                        if let Ok(e) = e {
                            log::error!("[{}] connection to MQTT broker lost: {e}", self.name);
                        }
                        backoff = wait_backoff(&ctx, backoff);
                        continue 'reconnect;
                    }
                    recv(changed) -> tag => {
                        // Publish-on-change mode (period == 0).
                        if let Ok(tag) = tag {
                            let value = self.values.read().get(&tag).copied();
                            if let Some(value) = value {
                                self.publish(&client, &tag, value);
                            }
                        }
                    }
                    default(self.tick_period()) => {
                        if self.period.is_zero() {
                            continue;
                        }

                        let values: Vec<(String, f64)> = self
                            .values
                            .read()
                            .iter()
                            .map(|(tag, value)| (tag.clone(), *value))
                            .collect();

                        for (tag, value) in values {
                            self.publish(&client, &tag, value);
                        }
                    }
                }
            }
        }
    }

    fn tick_period(&self) -> Duration {
        if self.period.is_zero() {
            // Change-driven mode; the timer only wakes the loop to poll the
            // shutdown token.
            Duration::from_secs(1)
        } else {
            self.period
        }
    }
}

fn wait_backoff(ctx: &RunContext, backoff: Duration) -> Duration {
    ctx.shutdown.wait_timeout(backoff);
    (backoff * 2).min(BACKOFF_MAX)
}

impl Module for MqttClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.configure_endpoint(child)?,
                "client-id" => self.id = xml::text(child).to_string(),
                "period" => {
                    let text = xml::text(child);
                    self.period = crate::util::parse_duration(text)
                        .map_err(|e| ConfigError::invalid("period", text, e))?;
                }
                "tag" => {
                    let tag = xml::text(child).to_string();
                    let topic = child
                        .attribute("topic")
                        .map(String::from)
                        .unwrap_or_else(|| tag.replace('.', "/"));

                    self.values.write().insert(tag.clone(), 0.0);
                    self.topics.insert(tag, topic);
                }
                "payload-template" => {
                    self.payload_template = xml::text(child).to_string();
                    self.timestamp_format = child.attribute("timestamp").map(String::from);
                }
                _ => {}
            }
        }

        if self.id.is_empty() {
            return Err(ConfigError::Other(
                "must provide 'client-id' for MQTT module config".into(),
            ));
        }

        for endpoint in &mut self.endpoints {
            endpoint.validate()?;
        }

        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        if self.endpoints.is_empty() {
            return Err(RuntimeError::StartFailed {
                module: self.name.clone(),
                reason: "no MQTT broker endpoints provided".into(),
            });
        }

        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);

        let (changed_tx, changed_rx) = unbounded();

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(&self.name);
        {
            let name = self.name.clone();
            let values = self.values.clone();
            let notify_changes = self.period.is_zero();
            subscriber.on_status(move |env| match env.status() {
                Ok(status) => {
                    for point in status.measurements {
                        let mut values = values.write();

                        if let Some(value) = values.get_mut(&point.tag) {
                            *value = point.value;

                            if notify_changes && changed_tx.send(point.tag).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting status message from envelope: {e}"),
            });
        }
        subscriber
            .start(RUNTIME_TOPIC, ctx.shutdown.clone())
            .map_err(RuntimeError::Io)?;

        let name = self.name.clone();
        let module = std::mem::replace(self, MqttClient::new(&name));
        let thread_ctx = ctx.clone();

        std::thread::Builder::new()
            .name(format!("mqtt-client-{name}"))
            .spawn(move || module.run_loop(changed_rx, thread_ctx))
            .map_err(RuntimeError::Io)?;

        Ok(())
    }
}
