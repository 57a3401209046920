// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Modbus client module (TCP or serial RTU).
//!
//! Polls the configured register list on a fixed period and publishes one
//! Status envelope per sweep, including a `<name>.connected` heartbeat.
//! Update envelopes for owned tags are written back to the peer device.
//!
//! The poll thread owns the connection; bus handlers hand work off through
//! a channel so they never block the dispatch loop on peer I/O.

use super::pdu::{Client, ProtocolError, RtuTransport, TcpTransport};
use super::register::{DataType, Register, RegisterType};
use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{Envelope, Point, Pusher, Status, Subscriber, RUNTIME_TOPIC};
use crate::runtime::{Module, RunContext};
use crossbeam::channel::{unbounded, Receiver};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct SerialConfig {
    device: String,
    baud_rate: u32,
    data_bits: serialport::DataBits,
    stop_bits: serialport::StopBits,
    parity: serialport::Parity,
    timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyS0".to_string(),
            baud_rate: 115_200,
            data_bits: serialport::DataBits::Eight,
            stop_bits: serialport::StopBits::One,
            parity: serialport::Parity::None,
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct ModbusClient {
    name: String,
    unit: u8,
    period: Duration,

    endpoint: Option<String>,
    serial: Option<SerialConfig>,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    registers: HashMap<String, Register>,
}

impl ModbusClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            unit: 1,
            period: Duration::from_secs(5),
            endpoint: None,
            serial: None,
            pub_endpoint: None,
            pull_endpoint: None,
            registers: HashMap::new(),
        }
    }

    fn peer(&self) -> Result<String, ConfigError> {
        match (&self.endpoint, &self.serial) {
            (Some(_), Some(_)) => Err(ConfigError::Other(format!(
                "cannot provide both endpoint and serial configuration options for {}",
                self.name
            ))),
            (Some(endpoint), None) => Ok(endpoint.clone()),
            (None, Some(serial)) => Ok(serial.device.clone()),
            (None, None) => Err(ConfigError::Other(format!(
                "must provide either endpoint or serial configuration option for {}",
                self.name
            ))),
        }
    }

    fn configure_serial(&mut self, node: xml::Node) -> Result<(), ConfigError> {
        let mut serial = SerialConfig::default();

        for child in xml::children(node) {
            let text = xml::text(child);
            match child.tag_name().name() {
                "device" => serial.device = text.to_string(),
                "baud-rate" => {
                    serial.baud_rate = text
                        .parse()
                        .map_err(|_| ConfigError::invalid("serial/baud-rate", text, "not an integer"))?
                }
                "data-bits" => {
                    serial.data_bits = match text {
                        "5" => serialport::DataBits::Five,
                        "6" => serialport::DataBits::Six,
                        "7" => serialport::DataBits::Seven,
                        "8" => serialport::DataBits::Eight,
                        _ => {
                            return Err(ConfigError::invalid(
                                "serial/data-bits",
                                text,
                                "must be 5-8",
                            ))
                        }
                    }
                }
                "stop-bits" => {
                    serial.stop_bits = match text {
                        "1" => serialport::StopBits::One,
                        "2" => serialport::StopBits::Two,
                        _ => {
                            return Err(ConfigError::invalid(
                                "serial/stop-bits",
                                text,
                                "must be 1 or 2",
                            ))
                        }
                    }
                }
                "parity" => {
                    serial.parity = if text.eq_ignore_ascii_case("none") {
                        serialport::Parity::None
                    } else if text.eq_ignore_ascii_case("even") {
                        serialport::Parity::Even
                    } else if text.eq_ignore_ascii_case("odd") {
                        serialport::Parity::Odd
                    } else {
                        return Err(ConfigError::invalid(
                            "serial/parity",
                            text,
                            "must be none, even, or odd",
                        ));
                    }
                }
                "timeout" => {
                    serial.timeout = crate::util::parse_duration(text)
                        .map_err(|e| ConfigError::invalid("serial/timeout", text, e))?
                }
                _ => {}
            }
        }

        self.serial = Some(serial);
        Ok(())
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

        let mut scaling = 0;
        if let Some(text) = xml::child_text(node, "scaling") {
            if dtype.is_integer() {
                scaling = text.parse().map_err(|_| {
                    ConfigError::invalid("register/scaling", text, "not an integer")
                })?;
            } else {
                log::warn!(
                    "[{}] scaling value ignored for registers using float data types",
                    self.name
                );
            }
        }

        let register = Register::new(rtype, dtype, addr, scaling, tag);
        self.registers.insert(register.tag.clone(), register);

        Ok(())
    }

    fn connect(&self) -> Result<Client, ProtocolError> {
        if let Some(endpoint) = &self.endpoint {
            let addr = crate::transport::tcp_addr(endpoint)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            let transport = TcpTransport::connect(addr, self.unit, Duration::from_secs(5))?;
            return Ok(Client::new(Box::new(transport)));
        }

        // `peer()` guarantees one of the two is set before run starts.
        let serial = self.serial.as_ref().expect("serial configuration present");

        let port = serialport::new(&serial.device, serial.baud_rate)
            .data_bits(serial.data_bits)
            .stop_bits(serial.stop_bits)
            .parity(serial.parity)
            .timeout(serial.timeout)
            .open()
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        Ok(Client::new(Box::new(RtuTransport::new(port, self.unit))))
    }

    fn sweep(&self, client: &mut Client, peer: &str) -> Vec<Point> {
        let mut points = Vec::with_capacity(self.registers.len());

        for (tag, reg) in &self.registers {
            let data = match reg.rtype {
                RegisterType::Coil => client.read_coils(reg.addr, 1),
                RegisterType::Discrete => client.read_discrete_inputs(reg.addr, 1),
                RegisterType::Input => client.read_input_registers(reg.addr, reg.count),
                RegisterType::Holding => client.read_holding_registers(reg.addr, reg.count),
            };

            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    log::error!(
                        "[{}] reading {} {} from {peer}: {e}",
                        self.name,
                        reg.rtype,
                        reg.addr
                    );
                    continue;
                }
            };

            match reg.value(&data) {
                Ok(value) => points.push(Point::new(tag, value)),
                Err(e) => log::error!("[{}] getting register value: {e}", self.name),
            }
        }

        points
    }

    fn write_back(&self, client: &mut Client, peer: &str, points: &[Point]) {
        for point in points {
            let Some(reg) = self.registers.get(&point.tag) else {
                continue;
            };

            match reg.rtype {
                RegisterType::Coil => {
                    // 0xFF00 per Modbus spec
                    let value: u16 = if point.value == 0.0 { 0x0000 } else { 0xFF00 };

                    if let Err(e) = client.write_single_coil(reg.addr, value) {
                        log::error!(
                            "[{}] writing to coil {} at {peer}: {e}",
                            self.name,
                            reg.addr
                        );
                        continue;
                    }

                    log::info!(
                        "[{}] writing coil {} at {peer} --> {}",
                        self.name,
                        reg.addr,
                        value != 0
                    );
                }
                RegisterType::Holding => {
                    let data = match reg.bytes(point.value) {
                        Ok(data) => data,
                        Err(e) => {
                            log::error!(
                                "[{}] converting register value to bytes: {e}",
                                self.name
                            );
                            continue;
                        }
                    };

                    if let Err(e) = client.write_multiple_registers(reg.addr, reg.count, &data) {
                        log::error!(
                            "[{}] writing to holding {} at {peer}: {e}",
                            self.name,
                            reg.addr
                        );
                        continue;
                    }

                    log::info!(
                        "[{}] writing holding {} at {peer} --> {}",
                        self.name,
                        reg.addr,
                        reg.scaled(point.value) as i64
                    );
                }
                _ => {}
            }
        }
    }

    fn poll_loop(self, pusher: Pusher, updates: Receiver<Vec<Point>>, ctx: RunContext) {
        let peer = self.peer().unwrap_or_default();
        let mut client: Option<Client> = None;

        loop {
            crossbeam::select! {
                recv(ctx.shutdown.channel()) -> _ => return,
                recv(updates) -> msg => {
                    let Ok(points) = msg else { return };

                    if client.is_none() {
                        client = self.reconnect(&peer);
                    }

                    if let Some(client) = client.as_mut() {
                        self.write_back(client, &peer, &points);
                    }
                }
                default(self.period) => {
                    if client.is_none() {
                        client = self.reconnect(&peer);
                    }

                    let mut points = match client.as_mut() {
                        Some(client) => self.sweep(client, &peer),
                        None => Vec::new(),
                    };

                    if points.is_empty() {
                        // Force a fresh connection on the next attempt.
                        client = None;

                        points.push(Point::new(format!("{}.connected", self.name), 0.0));
                        log::error!("[{}] no measurements read from {peer}", self.name);
                    } else {
                        points.push(Point::new(format!("{}.connected", self.name), 1.0));
                    }

                    let status = Status { measurements: points };
                    match Envelope::new(&self.name, &status) {
                        Ok(env) => {
                            if let Err(e) = pusher.push(RUNTIME_TOPIC, &env) {
                                log::error!("[{}] sending status message: {e}", self.name);
                            }
                        }
                        Err(e) => log::error!("[{}] creating status message: {e}", self.name),
                    }
                }
            }
        }
    }

    fn reconnect(&self, peer: &str) -> Option<Client> {
        match self.connect() {
            Ok(client) => Some(client),
            Err(e) => {
                log::error!("[{}] connecting to {peer}: {e}", self.name);
                None
            }
        }
    }
}

impl Module for ModbusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.endpoint = Some(xml::text(child).to_string()),
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
                "serial" => self.configure_serial(child)?,
                "register" => self.configure_register(child)?,
                _ => {}
            }
        }

        self.peer().map(|_| ())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        self.peer()?;

        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);

        let pusher = Pusher::connect(pull_endpoint)?;

        let (updates_tx, updates_rx) = unbounded();

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(&self.name);
        {
            let name = self.name.clone();
            let owned: std::collections::HashSet<String> =
                self.registers.keys().cloned().collect();
            subscriber.on_update(move |env| match env.update() {
                Ok(update) => {
                    let points: Vec<Point> = update
                        .updates
                        .into_iter()
                        .filter(|p| owned.contains(&p.tag))
                        .collect();

                    if !points.is_empty() && updates_tx.send(points).is_err() {
                        log::error!("[{name}] update channel closed");
                    }
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting update message from envelope: {e}"),
            });
        }
        subscriber
            .start(RUNTIME_TOPIC, ctx.shutdown.clone())
            .map_err(RuntimeError::Io)?;

        let name = self.name.clone();
        let module = std::mem::replace(self, ModbusClient::new(&name));
        let thread_ctx = ctx.clone();

        std::thread::Builder::new()
            .name(format!("modbus-client-{}", module.name))
            .spawn(move || module.poll_loop(pusher, updates_rx, thread_ctx))
            .map_err(RuntimeError::Io)?;

        Ok(())
    }
}
