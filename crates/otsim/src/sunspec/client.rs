// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SunSpec client module.
//!
//! Performs discovery once at startup: verify the "SunS" identifier at
//! 40000, then walk the `(id, length)` model chain until the end marker,
//! parsing each model's data region against the embedded schema. Raw point
//! bytes are retained until the whole model has been read so scale-factor
//! points resolve before numeric conversion.
//!
//! After discovery, each discovered model is re-read on a fixed period and
//! published as a Status envelope (with a `.connected` heartbeat).

use super::register::SsRegister;
use super::schema::{
    model_registers, model_schema, END_MODEL_ID, SUNSPEC_BASE_ADDR, SUNSPEC_IDENTIFIER,
};
use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::modbus::pdu::{Client, ProtocolError, TcpTransport};
use crate::msgbus::{Envelope, Point, Pusher, Status, RUNTIME_TOPIC};
use crate::runtime::{Module, RunContext};
use std::collections::HashMap;
use std::time::Duration;

/// Largest register span requested per read (Modbus allows 125).
const READ_CHUNK_WORDS: u16 = 120;

pub struct SunSpecClient {
    name: String,
    endpoint: String,
    unit: u8,
    period: Duration,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    /// Discovered model ids in chain order.
    order: Vec<u16>,
    /// Model id -> (data start address, data length in words).
    settings: HashMap<u16, (u16, u16)>,
    /// Latest parsed registers by point name, for scale resolution.
    points: HashMap<String, SsRegister>,
}

impl SunSpecClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: String::new(),
            unit: 1,
            period: Duration::from_secs(5),
            pub_endpoint: None,
            pull_endpoint: None,
            order: Vec::new(),
            settings: HashMap::new(),
            points: HashMap::new(),
        }
    }

    fn connect(&self) -> Result<Client, ProtocolError> {
        let addr = crate::transport::tcp_addr(&self.endpoint)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let transport = TcpTransport::connect(addr, self.unit, Duration::from_secs(5))?;
        Ok(Client::new(Box::new(transport)))
    }

    fn confirm_identifier(&self, client: &mut Client) -> Result<(), ProtocolError> {
        let data = client.read_holding_registers(SUNSPEC_BASE_ADDR, 2)?;

        if data.len() < 4 {
            return Err(ProtocolError::Malformed("short identifier read".into()));
        }

        let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if id != SUNSPEC_IDENTIFIER {
            return Err(ProtocolError::Malformed(format!(
                "identifier mismatch: got {id:#010x}, want {SUNSPEC_IDENTIFIER:#010x}"
            )));
        }

        Ok(())
    }

    fn read_model_data(
        &self,
        client: &mut Client,
        start: u16,
        length: u16,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::with_capacity(length as usize * 2);
        let mut addr = start;
        let mut remaining = length;

        while remaining > 0 {
            let span = remaining.min(READ_CHUNK_WORDS);
            let chunk = client.read_holding_registers(addr, span)?;
            data.extend_from_slice(&chunk);
            addr += span;
            remaining -= span;
        }

        Ok(data)
    }

    /// Slice a model's data region into its schema-ordered registers,
    /// retaining raw bytes per point.
    fn parse_model(&self, id: u16, data: &[u8]) -> Result<Vec<SsRegister>, RuntimeError> {
        let schema = model_schema(id)
            .map_err(|e| RuntimeError::StartFailed {
                module: self.name.clone(),
                reason: e.to_string(),
            })?;
        let registers = model_registers(&schema).map_err(|e| RuntimeError::StartFailed {
            module: self.name.clone(),
            reason: e.to_string(),
        })?;

        let mut out = Vec::with_capacity(registers.len());
        let mut offset = 0usize;

        for mut reg in registers {
            let end = offset + reg.count as usize * 2;
            if data.len() < end {
                return Err(RuntimeError::StartFailed {
                    module: self.name.clone(),
                    reason: format!("model {id} data shorter than schema ({} bytes)", data.len()),
                });
            }

            reg.raw = data[offset..end].to_vec();
            offset = end;
            out.push(reg);
        }

        Ok(out)
    }

    /// Store freshly parsed registers and convert them to points, resolving
    /// scale factors against everything read so far.
    fn process(&mut self, registers: Vec<SsRegister>) -> Vec<Point> {
        let names: Vec<String> = registers.iter().map(|r| r.name.clone()).collect();

        for reg in registers {
            self.points.insert(reg.name.clone(), reg);
        }

        let mut points = Vec::with_capacity(names.len());

        for name in names {
            let Some(reg) = self.points.get(&name) else {
                continue;
            };

            if reg.dtype.is_string() {
                match reg.string(Some(&reg.raw)) {
                    Ok(value) => log::debug!("[{}] {name} - {value}", self.name),
                    Err(e) => log::error!("[{}] parsing string value for point {name}: {e}", self.name),
                }
                continue;
            }

            if reg.dtype.is_meta() {
                continue;
            }

            let scale = match &reg.scale_register {
                Some(sf_name) => match self.points.get(sf_name) {
                    Some(sf) => match sf.value(Some(&sf.raw), 0) {
                        Ok(exp) => exp as i32,
                        Err(e) => {
                            log::error!("[{}] parsing scale factor {sf_name}: {e}", self.name);
                            continue;
                        }
                    },
                    None => {
                        log::error!("[{}] scaling factor {sf_name} does not exist", self.name);
                        continue;
                    }
                },
                None => reg.static_scale(),
            };

            match reg.value(Some(&reg.raw), scale) {
                Ok(value) => points.push(Point::new(&name, value)),
                Err(e) => log::error!("[{}] parsing value for point {name}: {e}", self.name),
            }
        }

        points
    }

    fn publish(&self, pusher: &Pusher, mut points: Vec<Point>) {
        if points.is_empty() {
            points.push(Point::new(format!("{}.connected", self.name), 0.0));
            log::error!("[{}] no measurements read from {}", self.name, self.endpoint);
        } else {
            points.push(Point::new(format!("{}.connected", self.name), 1.0));
        }

        let status = Status {
            measurements: points,
        };

        match Envelope::new(&self.name, &status) {
            Ok(env) => {
                if let Err(e) = pusher.push(RUNTIME_TOPIC, &env) {
                    log::error!("[{}] sending status message: {e}", self.name);
                }
            }
            Err(e) => log::error!("[{}] creating status message: {e}", self.name),
        }
    }

    /// Walk the device's model chain. Terminates after at most the number
    /// of models on the device, by construction of the walk.
    fn discover(&mut self, client: &mut Client, pusher: &Pusher) -> Result<(), RuntimeError> {
        self.confirm_identifier(client)
            .map_err(|e| RuntimeError::StartFailed {
                module: self.name.clone(),
                reason: format!(
                    "confirming SunSpec identifier from device {}: {e}",
                    self.endpoint
                ),
            })?;

        // Start after the well-known identifier.
        let mut addr = SUNSPEC_BASE_ADDR + 2;
        let mut model1 = false;

        loop {
            let head = client
                .read_holding_registers(addr, 2)
                .map_err(|e| RuntimeError::StartFailed {
                    module: self.name.clone(),
                    reason: format!("getting next model from device {}: {e}", self.endpoint),
                })?;

            let id = u16::from_be_bytes([head[0], head[1]]);
            let length = u16::from_be_bytes([head[2], head[3]]);

            if id == END_MODEL_ID {
                break;
            }

            if !model1 {
                if id == 1 {
                    model1 = true;
                } else {
                    return Err(RuntimeError::StartFailed {
                        module: self.name.clone(),
                        reason: "remote SunSpec device missing required Model 1".into(),
                    });
                }
            }

            // model id and length are 2 words long
            addr += 2;

            self.order.push(id);
            self.settings.insert(id, (addr, length));

            let data = self
                .read_model_data(client, addr, length)
                .map_err(|e| RuntimeError::StartFailed {
                    module: self.name.clone(),
                    reason: format!("reading model {id} data from device {}: {e}", self.endpoint),
                })?;

            let registers = self.parse_model(id, &data)?;
            let points = self.process(registers);
            self.publish(pusher, points);

            addr += length;
        }

        log::info!(
            "[{}] discovered models {:?} on {}",
            self.name,
            self.order,
            self.endpoint
        );

        Ok(())
    }

    fn poll_loop(mut self, mut client: Client, pusher: Pusher, ctx: RunContext) {
        loop {
            if ctx.shutdown.wait_timeout(self.period) {
                return;
            }

            let mut points = Vec::new();
            let mut failed = false;

            for id in self.order.clone() {
                let (start, length) = self.settings[&id];

                let data = match self.read_model_data(&mut client, start, length) {
                    Ok(data) => data,
                    Err(e) => {
                        log::error!(
                            "[{}] reading model {id} data from device {}: {e}",
                            self.name,
                            self.endpoint
                        );
                        failed = true;
                        continue;
                    }
                };

                match self.parse_model(id, &data) {
                    Ok(registers) => points.extend(self.process(registers)),
                    Err(e) => log::error!("[{}] processing model {id} data: {e}", self.name),
                }
            }

            if failed {
                // Reconnect before the next sweep.
                if let Ok(fresh) = self.connect() {
                    client = fresh;
                }
            }

            self.publish(&pusher, points);
        }
    }
}

impl Module for SunSpecClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.endpoint = xml::text(child).to_string(),
                "unit-id" => {
                    let text = xml::text(child);
                    self.unit = text.parse().map_err(|_| {
                        ConfigError::invalid("unit-id", text, "not an 8-bit integer")
                    })?;
                }
                "period" => {
                    let text = xml::text(child);
                    self.period = crate::util::parse_duration(text)
                        .map_err(|e| ConfigError::invalid("period", text, e))?;
                }
                _ => {}
            }
        }

        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingElement {
                module: self.name.clone(),
                element: "endpoint".into(),
            });
        }

        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);
        let pusher = Pusher::connect(pull_endpoint)?;

        let mut client = self.connect().map_err(|e| RuntimeError::StartFailed {
            module: self.name.clone(),
            reason: format!("connecting to SunSpec device {}: {e}", self.endpoint),
        })?;

        let name = self.name.clone();
        let mut module = std::mem::replace(self, SunSpecClient::new(&name));

        module.discover(&mut client, &pusher)?;

        let thread_ctx = ctx.clone();
        std::thread::Builder::new()
            .name(format!("sunspec-client-{name}"))
            .spawn(move || module.poll_loop(client, pusher, thread_ctx))
            .map_err(RuntimeError::Io)?;

        Ok(())
    }
}
