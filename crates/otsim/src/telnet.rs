// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telnet admin shell.
//!
//! A line-oriented TCP shell with the same semantics as the REST surface:
//! `query`, `write`, `date`, `modules`, `enable`, `disable`. Module
//! commands go through the ModuleControl/Confirmation flow with a
//! correlation id and a five-second timeout.

use crate::config::xml;
use crate::control::ControlClient;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{Envelope, Point, Pusher, Status, Subscriber, Update, RUNTIME_TOPIC};
use crate::runtime::{Module, RunContext};
use crate::tags::TagStore;
use crate::util::Shutdown;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BANNER: &str = "OT-sim admin shell. Type 'help' for commands.";

pub struct Telnet {
    name: String,
    endpoint: String,
    banner: String,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    tags: TagStore,
}

impl Telnet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: "0.0.0.0:23".to_string(),
            banner: DEFAULT_BANNER.to_string(),
            pub_endpoint: None,
            pull_endpoint: None,
            tags: TagStore::new(),
        }
    }
}

impl Module for Telnet {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "endpoint" => self.endpoint = xml::text(child).to_string(),
                "banner" => self.banner = xml::text(child).to_string(),
                _ => {}
            }
        }

        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);

        let pusher = Arc::new(Pusher::connect(pull_endpoint)?);
        let control =
            ControlClient::start(pub_endpoint, pull_endpoint, &self.name, ctx.shutdown.clone())?;

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

        let addr = crate::transport::tcp_addr(&self.endpoint)?;
        let listener = TcpListener::bind(addr).map_err(RuntimeError::Io)?;
        listener.set_nonblocking(true).map_err(RuntimeError::Io)?;

        log::info!("[{}] listening at {}", self.name, self.endpoint);

        let shell = Arc::new(Shell {
            name: self.name.clone(),
            banner: self.banner.clone(),
            tags: self.tags.clone(),
            pusher,
            control,
        });

        let shutdown = ctx.shutdown.clone();
        let name = self.name.clone();

        std::thread::Builder::new()
            .name(format!("telnet-{name}"))
            .spawn(move || {
                while !shutdown.is_tripped() {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            log::debug!("[{name}] connection from {peer}");

                            let shell = shell.clone();
                            let shutdown = shutdown.clone();
                            let spawned = std::thread::Builder::new()
                                .name(format!("telnet-conn-{name}"))
                                .spawn(move || {
                                    if let Err(e) = shell.session(stream, shutdown) {
                                        if e.kind() != io::ErrorKind::UnexpectedEof {
                                            log::debug!("[telnet] session error: {e}");
                                        }
                                    }
                                });

                            if let Err(e) = spawned {
                                log::warn!("[{name}] spawning session: {e}");
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            shutdown.wait_timeout(Duration::from_millis(250));
                        }
                        Err(e) => {
                            log::warn!("[{name}] accept: {e}");
                            shutdown.wait_timeout(Duration::from_millis(250));
                        }
                    }
                }
            })
            .map_err(RuntimeError::Io)?;

        Ok(())
    }
}

struct Shell {
    name: String,
    banner: String,
    tags: TagStore,
    pusher: Arc<Pusher>,
    control: Arc<ControlClient>,
}

impl Shell {
    fn session(&self, stream: TcpStream, shutdown: Shutdown) -> io::Result<()> {
        stream.set_read_timeout(Some(Duration::from_millis(250)))?;

        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        writeln!(writer, "{}", self.banner)?;
        write!(writer, "> ")?;
        writer.flush()?;

        let mut line = String::new();

        loop {
            if shutdown.is_tripped() {
                return Ok(());
            }

            // Character-mode clients deliver a line over many reads; keep
            // accumulating across timeouts until the newline arrives.
            match reader.read_line(&mut line) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    if !line.ends_with('\n') {
                        continue;
                    }
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }

            {
                let mut parts = line.split_whitespace();
                let Some(command) = parts.next() else {
                    line.clear();
                    write!(writer, "> ")?;
                    writer.flush()?;
                    continue;
                };
                let args: Vec<&str> = parts.collect();

                match command {
                    "query" => self.query(&mut writer, &args)?,
                    "write" => self.write(&mut writer, &args)?,
                    "date" => writeln!(writer, "{}", chrono::Local::now().to_rfc2822())?,
                    "modules" => self.modules(&mut writer)?,
                    "enable" => self.toggle(&mut writer, &args, true)?,
                    "disable" => self.toggle(&mut writer, &args, false)?,
                    "help" => {
                        writeln!(writer, "commands: query [tag...], write <tag> <value>, date, modules, enable <name...>, disable <name...>, exit")?;
                    }
                    "exit" | "quit" => return Ok(()),
                    other => writeln!(writer, "unknown command '{other}'")?,
                }
            }

            line.clear();
            write!(writer, "> ")?;
            writer.flush()?;
        }
    }

    fn query(&self, writer: &mut TcpStream, args: &[&str]) -> io::Result<()> {
        if args.is_empty() {
            let mut snapshot: Vec<(String, f64)> = self.tags.snapshot().into_iter().collect();
            snapshot.sort_by(|a, b| a.0.cmp(&b.0));

            for (tag, value) in snapshot {
                writeln!(writer, "{tag} = {value:.6}")?;
            }
            return Ok(());
        }

        for tag in args {
            match self.tags.read(tag) {
                Some(value) => writeln!(writer, "{tag} = {value:.6}")?,
                None => writeln!(writer, "tag {tag} is unknown")?,
            }
        }

        Ok(())
    }

    fn write(&self, writer: &mut TcpStream, args: &[&str]) -> io::Result<()> {
        if args.len() != 2 {
            writeln!(writer, "must provide two values to write function")?;
            return Ok(());
        }

        let tag = args[0];
        let value: f64 = match args[1].parse() {
            Ok(value) => value,
            Err(_) => {
                writeln!(writer, "invalid value {}", args[1])?;
                return Ok(());
            }
        };

        let points = vec![Point::new(tag, value)];

        let status = Status {
            measurements: points.clone(),
        };
        let update = Update {
            updates: points,
            ..Default::default()
        };

        let pushed = Envelope::new(&self.name, &status)
            .map_err(|e| e.to_string())
            .and_then(|env| {
                self.pusher
                    .push(RUNTIME_TOPIC, &env)
                    .map_err(|e| e.to_string())
            })
            .and_then(|_| Envelope::new(&self.name, &update).map_err(|e| e.to_string()))
            .and_then(|env| {
                self.pusher
                    .push(RUNTIME_TOPIC, &env)
                    .map_err(|e| e.to_string())
            });

        match pushed {
            Ok(()) => writeln!(writer, "wrote {tag}={value:.6}")?,
            Err(e) => {
                log::error!("[{}] sending write: {e}", self.name);
                writeln!(writer, "write failed")?;
            }
        }

        Ok(())
    }

    fn modules(&self, writer: &mut TcpStream) -> io::Result<()> {
        match self.control.list() {
            Ok(confirmation) => {
                for (name, state) in confirmation.results {
                    writeln!(writer, "{name} --> {state}")?;
                }
            }
            Err(e) => writeln!(writer, "request for module list timed out ({e})")?,
        }

        Ok(())
    }

    fn toggle(&self, writer: &mut TcpStream, args: &[&str], enable: bool) -> io::Result<()> {
        if args.is_empty() {
            let verb = if enable { "enable" } else { "disable" };
            writeln!(writer, "must provide at least one module to {verb}")?;
            return Ok(());
        }

        let names: Vec<String> = args.iter().map(|s| s.to_string()).collect();

        let result = if enable {
            self.control.enable(names)
        } else {
            self.control.disable(names)
        };

        match result {
            Ok(confirmation) => {
                for (name, state) in confirmation.results {
                    writeln!(writer, "{name} --> {state}")?;
                }
                for (name, error) in confirmation.errors {
                    writeln!(writer, "{name} --> {error}")?;
                }
            }
            Err(e) => writeln!(writer, "module request timed out ({e})")?,
        }

        Ok(())
    }
}

/// Factory for the `<telnet>` config element.
pub struct Factory;

impl crate::runtime::ModuleFactory for Factory {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        let name = node.attribute("name").unwrap_or("telnet");
        Ok(Box::new(Telnet::new(name)))
    }
}
