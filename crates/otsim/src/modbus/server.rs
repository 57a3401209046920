// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Modbus TCP server module.
//!
//! Serves the configured register map to external masters. Reads pull from
//! the shared tag store (kept current by RUNTIME Status envelopes); writes
//! update the tag store and push an Update envelope so the rest of the
//! simulator converges on the new value.

use super::bits::{bits_to_bytes, bytes_to_bits};
use super::pdu::{self, Exception, PduHandler, TcpServer};
use super::register::{DataType, Register, RegisterType};
use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{
    Envelope, MetricKind, MetricsPusher, Point, Pusher, Subscriber, Update, RUNTIME_TOPIC,
};
use crate::runtime::{Module, RunContext};
use crate::tags::TagStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct ModbusServer {
    name: String,
    endpoint: String,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    registers: HashMap<RegisterType, BTreeMap<u16, Register>>,
    tags: TagStore,
    metrics: MetricsPusher,
}

impl ModbusServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: String::new(),
            pub_endpoint: None,
            pull_endpoint: None,
            registers: HashMap::new(),
            tags: TagStore::new(),
            metrics: MetricsPusher::new(),
        }
    }

    fn configure_register(&mut self, node: xml::Node) -> Result<(), ConfigError> {
        let rtype = node
            .attribute("type")
            .ok_or_else(|| ConfigError::MissingElement {
                module: self.name.clone(),
                element: "register/@type".into(),
            })?;
        let rtype = RegisterType::parse(rtype)
            .map_err(|e| ConfigError::invalid("register/@type", rtype, e))?;

        let dtype = if rtype.is_bit() {
            DataType::Uint16
        } else {
            let text = xml::attr_or(node, "data-type", "uint16");
            DataType::parse(text)
                .map_err(|e| ConfigError::invalid("register/@data-type", text, e))?
        };

        let addr = xml::child_text(node, "address").ok_or_else(|| ConfigError::MissingElement {
            module: self.name.clone(),
            element: "register/address".into(),
        })?;
        let addr: u16 = addr
            .parse()
            .map_err(|_| ConfigError::invalid("register/address", addr, "not a 16-bit integer"))?;

        let tag = xml::child_text(node, "tag").ok_or_else(|| ConfigError::MissingElement {
            module: self.name.clone(),
            element: "register/tag".into(),
        })?;

        let scaling = match xml::child_text(node, "scaling") {
            Some(text) => text
                .parse()
                .map_err(|_| ConfigError::invalid("register/scaling", text, "not an integer"))?,
            None => 0,
        };

        let register = Register::new(rtype, dtype, addr, scaling, tag);
        self.tags.seed([register.tag.clone()]);
        self.registers.entry(rtype).or_default().insert(addr, register);

        Ok(())
    }
}

impl Module for ModbusServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.endpoint = xml::text(child).to_string(),
                "register" => self.configure_register(child)?,
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
        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);

        let pusher = Arc::new(Pusher::connect(pull_endpoint)?);

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(&self.name);
        {
            let name = self.name.clone();
            let tags = self.tags.clone();
            let metrics = self.metrics.clone();
            subscriber.on_status(move |env| {
                metrics.incr("status_count");

                match env.status() {
                    Ok(status) => {
                        for point in status.measurements {
                            log::debug!("[{name}] setting tag {} to value {}", point.tag, point.value);
                            tags.write(&point.tag, point.value);
                        }
                    }
                    Err(e) if e.is_kind_mismatch() => {}
                    Err(e) => log::error!("[{name}] getting status message from envelope: {e}"),
                }
            });
        }
        subscriber
            .start(RUNTIME_TOPIC, ctx.shutdown.clone())
            .map_err(RuntimeError::Io)?;

        self.metrics.register(
            MetricKind::Counter,
            "status_count",
            "number of status messages processed",
        );
        self.metrics.register(
            MetricKind::Counter,
            "coil_writes_count",
            "number of coil writes processed",
        );
        self.metrics.register(
            MetricKind::Counter,
            "holding_writes_count",
            "number of holding writes processed",
        );
        self.metrics
            .start(pusher.clone(), &self.name, ctx.shutdown.clone());

        let handler = Arc::new(WireHandler {
            name: self.name.clone(),
            registers: std::mem::take(&mut self.registers),
            tags: self.tags.clone(),
            pusher,
            metrics: self.metrics.clone(),
        });

        let addr = crate::transport::tcp_addr(&self.endpoint)?;
        let server = TcpServer::bind(addr, handler, ctx.shutdown.clone()).map_err(RuntimeError::Io)?;

        log::info!("[{}] listening at {}", self.name, server.local_addr());

        Ok(())
    }
}

/// Wire-side state shared by every connection thread. The register maps are
/// immutable after configuration.
struct WireHandler {
    name: String,
    registers: HashMap<RegisterType, BTreeMap<u16, Register>>,
    tags: TagStore,
    pusher: Arc<Pusher>,
    metrics: MetricsPusher,
}

impl WireHandler {
    fn bank(&self, rtype: RegisterType) -> Result<&BTreeMap<u16, Register>, Exception> {
        self.registers
            .get(&rtype)
            .ok_or(Exception::IllegalDataAddress)
    }

    fn push_updates(&self, updates: Vec<Point>) -> Result<(), Exception> {
        let update = Update {
            updates,
            ..Default::default()
        };

        let env = Envelope::new(&self.name, &update).map_err(|e| {
            log::error!("[{}] creating new update message: {e}", self.name);
            Exception::SlaveDeviceFailure
        })?;

        self.pusher.push(RUNTIME_TOPIC, &env).map_err(|e| {
            log::error!("[{}] sending update message: {e}", self.name);
            Exception::SlaveDeviceFailure
        })
    }

    fn read_range(data: &[u8]) -> Result<(u16, u16), Exception> {
        if data.len() < 4 {
            return Err(Exception::IllegalDataValue);
        }

        Ok((
            u16::from_be_bytes([data[0], data[1]]),
            u16::from_be_bytes([data[2], data[3]]),
        ))
    }

    /// FC 1 / FC 2.
    fn read_bits(&self, rtype: RegisterType, data: &[u8]) -> Result<Vec<u8>, Exception> {
        let bank = self.bank(rtype)?;
        let (start, count) = Self::read_range(data)?;

        let mut bits = Vec::with_capacity(count as usize);

        for addr in start..start.saturating_add(count) {
            let reg = bank.get(&addr).ok_or(Exception::IllegalDataAddress)?;
            let value = self.tags.read_or_zero(&reg.tag);
            bits.push(if value == 0.0 { 0 } else { 1 });
        }

        let packed = bits_to_bytes(&bits);
        let mut resp = vec![packed.len() as u8];
        resp.extend_from_slice(&packed);
        Ok(resp)
    }

    /// FC 3 / FC 4. Multi-word registers consume their full span of the
    /// requested range.
    fn read_registers(&self, rtype: RegisterType, data: &[u8]) -> Result<Vec<u8>, Exception> {
        let bank = self.bank(rtype)?;
        let (start, count) = Self::read_range(data)?;

        let mut out = Vec::with_capacity(count as usize * 2);
        let mut addr = start;

        while addr < start.saturating_add(count) {
            let reg = bank.get(&addr).ok_or(Exception::IllegalDataAddress)?;

            let value = self.tags.read_or_zero(&reg.tag);
            let buf = reg.bytes(value).map_err(|_| Exception::SlaveDeviceFailure)?;
            out.extend_from_slice(&buf);

            addr += reg.count;
        }

        let mut resp = vec![out.len() as u8];
        resp.extend_from_slice(&out);
        Ok(resp)
    }

    /// FC 5.
    fn write_coil(&self, data: &[u8]) -> Result<Vec<u8>, Exception> {
        let bank = self.bank(RegisterType::Coil)?;
        let (addr, raw) = Self::read_range(data)?;

        let reg = bank.get(&addr).ok_or(Exception::IllegalDataAddress)?;

        // 0xFF00 per Modbus spec; any non-zero wire value closes the coil.
        let value = if raw == 0 { 0.0 } else { 1.0 };

        self.tags.write(&reg.tag, value);
        log::info!("[{}] updating tag {} --> {}", self.name, reg.tag, value != 0.0);

        self.push_updates(vec![Point::new(&reg.tag, value)])?;
        self.metrics.incr("coil_writes_count");

        Ok(data[0..4].to_vec())
    }

    /// FC 15.
    fn write_coils(&self, data: &[u8]) -> Result<Vec<u8>, Exception> {
        let bank = self.bank(RegisterType::Coil)?;
        let (start, count) = Self::read_range(data)?;

        // beginning of data to be written starts at offset 5
        if data.len() < 5 {
            return Err(Exception::IllegalDataValue);
        }
        let bits = bytes_to_bits(&data[5..]);

        if bits.len() < count as usize {
            return Err(Exception::IllegalDataValue);
        }

        let mut updates = Vec::with_capacity(count as usize);

        for addr in start..start.saturating_add(count) {
            let reg = bank.get(&addr).ok_or(Exception::IllegalDataAddress)?;

            let value = bits[(addr - start) as usize] as f64;
            self.tags.write(&reg.tag, value);

            log::info!("[{}] updating tag {} --> {}", self.name, reg.tag, value != 0.0);
            updates.push(Point::new(&reg.tag, value));
        }

        if !updates.is_empty() {
            self.push_updates(updates)?;
        }

        self.metrics.incr_by("coil_writes_count", count as usize);
        Ok(data[0..4].to_vec())
    }

    /// FC 6.
    fn write_holding(&self, data: &[u8]) -> Result<Vec<u8>, Exception> {
        let bank = self.bank(RegisterType::Holding)?;
        let (addr, _) = Self::read_range(data)?;

        let reg = bank.get(&addr).ok_or(Exception::IllegalDataAddress)?;

        let value = reg
            .value(&data[2..4])
            .map_err(|_| Exception::IllegalDataValue)?;

        self.tags.write(&reg.tag, value);
        log::info!("[{}] updating tag {} --> {}", self.name, reg.tag, value);

        self.push_updates(vec![Point::new(&reg.tag, value)])?;
        self.metrics.incr("holding_writes_count");

        Ok(data[0..4].to_vec())
    }

    /// FC 16.
    fn write_holdings(&self, data: &[u8]) -> Result<Vec<u8>, Exception> {
        let bank = self.bank(RegisterType::Holding)?;
        let (start, count) = Self::read_range(data)?;

        // beginning of data to be written starts at offset 5
        let mut idx = 5;
        let mut addr = start;
        let mut updates = Vec::new();

        while addr < start.saturating_add(count) {
            let reg = bank.get(&addr).ok_or(Exception::IllegalDataAddress)?;

            let end = idx + reg.count as usize * 2;
            if data.len() < end {
                return Err(Exception::IllegalDataValue);
            }

            let value = reg
                .value(&data[idx..end])
                .map_err(|_| Exception::IllegalDataValue)?;

            self.tags.write(&reg.tag, value);
            log::info!("[{}] updating tag {} --> {}", self.name, reg.tag, value);
            updates.push(Point::new(&reg.tag, value));

            addr += reg.count;
            idx = end;
        }

        if !updates.is_empty() {
            self.push_updates(updates)?;
        }

        self.metrics.incr_by("holding_writes_count", count as usize);
        Ok(data[0..4].to_vec())
    }
}

impl PduHandler for WireHandler {
    fn handle(&self, function: u8, data: &[u8]) -> Result<Vec<u8>, Exception> {
        match function {
            pdu::READ_COILS => self.read_bits(RegisterType::Coil, data),
            pdu::READ_DISCRETE_INPUTS => self.read_bits(RegisterType::Discrete, data),
            pdu::READ_HOLDING_REGISTERS => self.read_registers(RegisterType::Holding, data),
            pdu::READ_INPUT_REGISTERS => self.read_registers(RegisterType::Input, data),
            pdu::WRITE_SINGLE_COIL => self.write_coil(data),
            pdu::WRITE_SINGLE_REGISTER => self.write_holding(data),
            pdu::WRITE_MULTIPLE_COILS => self.write_coils(data),
            pdu::WRITE_MULTIPLE_REGISTERS => self.write_holdings(data),
            _ => Err(Exception::IllegalFunction),
        }
    }
}
