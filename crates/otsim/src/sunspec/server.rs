// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SunSpec server module.
//!
//! Composes the configured models into a holding-register bank starting at
//! 40000: the "SunS" identifier, then each model as `(id, length, data)`,
//! then the end marker. Only Modbus FC 3 (read) and FC 16 (write) are
//! served; everything else returns IllegalFunction.
//!
//! Model 1 must be configured first; anything else is a configuration
//! error per the SunSpec layout requirements.

use super::register::{SsRegister, SunSpecType};
use super::schema::{
    model_length, model_registers, model_schema, END_MODEL_ID, SUNSPEC_BASE_ADDR,
    SUNSPEC_IDENTIFIER,
};
use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::modbus::pdu::{self, Exception, PduHandler, TcpServer};
use crate::msgbus::{
    Envelope, MetricKind, MetricsPusher, Point, Pusher, Subscriber, Update, RUNTIME_TOPIC,
};
use crate::runtime::{Module, RunContext};
use crate::tags::TagStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// How a configured point gets its value.
enum PointInit {
    Value(f64),
    Text(String),
    Tag(String),
}

pub struct SunSpecServer {
    name: String,
    endpoint: String,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    /// Configured models in document order: (id, point name -> init).
    models: Vec<(u16, HashMap<String, PointInit>)>,

    tags: TagStore,
    metrics: MetricsPusher,
}

impl SunSpecServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: String::new(),
            pub_endpoint: None,
            pull_endpoint: None,
            models: Vec::new(),
            tags: TagStore::new(),
            metrics: MetricsPusher::new(),
        }
    }

    fn configure_model(&mut self, node: xml::Node) -> Result<(), ConfigError> {
        let id = node.attribute("id").ok_or_else(|| ConfigError::MissingElement {
            module: self.name.clone(),
            element: "model/@id".into(),
        })?;
        let id: u16 = id
            .parse()
            .map_err(|_| ConfigError::invalid("model/@id", id, "not a 16-bit integer"))?;

        let mut inits = HashMap::new();

        for point in xml::children(node) {
            if point.tag_name().name() != "point" {
                continue;
            }

            let name = point.attribute("name").ok_or_else(|| ConfigError::MissingElement {
                module: self.name.clone(),
                element: "point/@name".into(),
            })?;

            if let Some(tag) = point.attribute("tag") {
                self.tags.seed([tag]);
                inits.insert(name.to_string(), PointInit::Tag(tag.to_string()));
                continue;
            }

            let text = xml::text(point);
            let init = match text.parse::<f64>() {
                Ok(value) => PointInit::Value(value),
                Err(_) => PointInit::Text(text.to_string()),
            };
            inits.insert(name.to_string(), init);
        }

        self.models.push((id, inits));
        Ok(())
    }

    /// Lay the configured models out into an address-indexed register bank.
    fn compose(&self) -> Result<Bank, ConfigError> {
        match self.models.first() {
            Some((1, _)) => {}
            _ => {
                return Err(ConfigError::Other(format!(
                    "SunSpec Model 1 must be configured first for {}",
                    self.name
                )))
            }
        }

        let mut bank = Bank::default();

        let mut identifier = SsRegister::new("SunSpec_ID", SunSpecType::Uint32);
        identifier.internal_value = SUNSPEC_IDENTIFIER as f64;
        bank.insert(SUNSPEC_BASE_ADDR, identifier, usize::MAX);

        let mut cursor = SUNSPEC_BASE_ADDR + 2;

        for (idx, (id, inits)) in self.models.iter().enumerate() {
            let schema = model_schema(*id)
                .map_err(|e| ConfigError::invalid("model/@id", &id.to_string(), e))?;

            let mut id_reg = SsRegister::new("Model_ID", SunSpecType::Uint16);
            id_reg.internal_value = *id as f64;
            bank.insert(cursor, id_reg, usize::MAX);

            let mut len_reg = SsRegister::new("Model_Length", SunSpecType::Uint16);
            len_reg.internal_value = model_length(&schema) as f64;
            bank.insert(cursor + 1, len_reg, usize::MAX);

            cursor += 2;

            let registers = model_registers(&schema)
                .map_err(|e| ConfigError::invalid("model", &id.to_string(), e))?;

            bank.names.push(HashMap::new());

            for mut reg in registers {
                match inits.get(&reg.name) {
                    Some(PointInit::Value(value)) => reg.internal_value = *value,
                    Some(PointInit::Text(text)) => reg.internal_string = text.clone(),
                    Some(PointInit::Tag(tag)) => reg.tag = Some(tag.clone()),
                    None => {}
                }

                let count = reg.count;
                bank.names[idx].insert(reg.name.clone(), cursor);
                bank.insert(cursor, reg, idx);
                cursor += count;
            }
        }

        let mut end_reg = SsRegister::new("End_Model_ID", SunSpecType::Uint16);
        end_reg.internal_value = END_MODEL_ID as f64;
        bank.insert(cursor, end_reg, usize::MAX);

        // Terminator length word is zero.
        let end_len = SsRegister::new("End_Model_Length", SunSpecType::Uint16);
        bank.insert(cursor + 1, end_len, usize::MAX);

        Ok(bank)
    }
}

impl Module for SunSpecServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.endpoint = xml::text(child).to_string(),
                "model" => self.configure_model(child)?,
                _ => {}
            }
        }

        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingElement {
                module: self.name.clone(),
                element: "endpoint".into(),
            });
        }

        // Validate the layout up front so a bad model id fails startup
        // instead of the first wire request.
        self.compose().map(|_| ())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);

        let pusher = Arc::new(Pusher::connect(pull_endpoint)?);

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(&self.name);
        {
            let name = self.name.clone();
            let tags = self.tags.clone();
            subscriber.on_status(move |env| match env.status() {
                Ok(status) => {
                    for point in status.measurements {
                        tags.write(&point.tag, point.value);
                    }
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting status message from envelope: {e}"),
            });
        }
        subscriber
            .start(RUNTIME_TOPIC, ctx.shutdown.clone())
            .map_err(RuntimeError::Io)?;

        self.metrics.register(
            MetricKind::Counter,
            "holding_writes_count",
            "number of holding writes processed",
        );
        self.metrics
            .start(pusher.clone(), &self.name, ctx.shutdown.clone());

        let bank = self.compose()?;

        let handler = Arc::new(WireHandler {
            name: self.name.clone(),
            bank: RwLock::new(bank),
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

/// Address-indexed register bank plus per-model name lookup for scale
/// factor resolution.
#[derive(Default)]
struct Bank {
    registers: BTreeMap<u16, BankEntry>,
    /// Per configured model: point name -> address.
    names: Vec<HashMap<String, u16>>,
}

struct BankEntry {
    reg: SsRegister,
    /// Index into `names`; `usize::MAX` for header/terminator words.
    model: usize,
}

impl Bank {
    fn insert(&mut self, addr: u16, reg: SsRegister, model: usize) {
        self.registers.insert(addr, BankEntry { reg, model });
    }

    /// Current engineering value of the register at `addr`: the bound tag's
    /// value when present, the internal value otherwise.
    fn current_value(&self, entry: &BankEntry, tags: &TagStore) -> f64 {
        match &entry.reg.tag {
            Some(tag) => tags.read_or_zero(tag),
            None => entry.reg.internal_value,
        }
    }

    /// Resolve the scale exponent for a register at access time.
    fn resolve_scale(&self, entry: &BankEntry, tags: &TagStore) -> i32 {
        if !entry.reg.scalable() {
            return 0;
        }

        let Some(sf_name) = &entry.reg.scale_register else {
            return entry.reg.static_scale();
        };

        let addr = self
            .names
            .get(entry.model)
            .and_then(|names| names.get(sf_name));

        match addr.and_then(|addr| self.registers.get(addr)) {
            Some(sf_entry) => self.current_value(sf_entry, tags) as i32,
            None => {
                log::error!("scaling factor {sf_name} does not exist");
                0
            }
        }
    }
}

struct WireHandler {
    name: String,
    bank: RwLock<Bank>,
    tags: TagStore,
    pusher: Arc<Pusher>,
    metrics: MetricsPusher,
}

impl WireHandler {
    /// FC 3.
    fn read_holdings(&self, data: &[u8]) -> Result<Vec<u8>, Exception> {
        if data.len() < 4 {
            return Err(Exception::IllegalDataValue);
        }

        let start = u16::from_be_bytes([data[0], data[1]]);
        let count = u16::from_be_bytes([data[2], data[3]]);

        let bank = self.bank.read();
        let mut out = Vec::with_capacity(count as usize * 2);
        let mut addr = start;

        while addr < start.saturating_add(count) {
            let entry = bank
                .registers
                .get(&addr)
                .ok_or(Exception::IllegalDataAddress)?;

            let buf = if entry.reg.dtype.is_string() {
                entry
                    .reg
                    .string_bytes(&entry.reg.internal_string)
                    .map_err(|_| Exception::SlaveDeviceFailure)?
            } else {
                let value = bank.current_value(entry, &self.tags);
                let scale = bank.resolve_scale(entry, &self.tags);
                entry
                    .reg
                    .bytes(value, scale)
                    .map_err(|_| Exception::SlaveDeviceFailure)?
            };

            out.extend_from_slice(&buf);
            addr += entry.reg.count;
        }

        let mut resp = vec![out.len() as u8];
        resp.extend_from_slice(&out);
        Ok(resp)
    }

    /// FC 16.
    fn write_holdings(&self, data: &[u8]) -> Result<Vec<u8>, Exception> {
        if data.len() < 5 {
            return Err(Exception::IllegalDataValue);
        }

        let start = u16::from_be_bytes([data[0], data[1]]);
        let count = u16::from_be_bytes([data[2], data[3]]);

        let mut bank = self.bank.write();
        let mut idx = 5;
        let mut addr = start;
        let mut updates = Vec::new();

        while addr < start.saturating_add(count) {
            let entry = bank
                .registers
                .get(&addr)
                .ok_or(Exception::IllegalDataAddress)?;

            let end = idx + entry.reg.count as usize * 2;
            if data.len() < end {
                return Err(Exception::IllegalDataValue);
            }

            let reg_count = entry.reg.count;

            if entry.reg.dtype.is_string() {
                let text = entry
                    .reg
                    .string(Some(&data[idx..end]))
                    .map_err(|_| Exception::IllegalDataValue)?;

                if let Some(entry) = bank.registers.get_mut(&addr) {
                    entry.reg.internal_string = text;
                }
            } else {
                let scale = bank.resolve_scale(entry, &self.tags);
                let value = entry
                    .reg
                    .value(Some(&data[idx..end]), scale)
                    .map_err(|_| Exception::IllegalDataValue)?;

                match entry.reg.tag.clone() {
                    Some(tag) => {
                        self.tags.write(&tag, value);
                        log::info!("[{}] updating tag {tag} --> {value}", self.name);
                        updates.push(Point::new(&tag, value));
                    }
                    None => {
                        if let Some(entry) = bank.registers.get_mut(&addr) {
                            entry.reg.internal_value = value;
                        }
                    }
                }
            }

            addr += reg_count;
            idx = end;
        }

        drop(bank);

        if !updates.is_empty() {
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
            })?;
        }

        self.metrics.incr_by("holding_writes_count", count as usize);
        Ok(data[0..4].to_vec())
    }
}

impl PduHandler for WireHandler {
    fn handle(&self, function: u8, data: &[u8]) -> Result<Vec<u8>, Exception> {
        match function {
            pdu::READ_HOLDING_REGISTERS => self.read_holdings(data),
            pdu::WRITE_MULTIPLE_REGISTERS => self.write_holdings(data),
            _ => Err(Exception::IllegalFunction),
        }
    }
}
