// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscribe side of the bus.
//!
//! A subscriber connects to the aggregator's publish endpoint, filters on a
//! single topic, and dispatches each decoded envelope to every handler
//! registered for its kind, in registration order. Envelopes whose sender
//! matches the subscriber's own name are dropped before dispatch, which
//! prevents feedback loops when a module both publishes and subscribes.
//!
//! Transient receive errors are reported on an error channel and the receive
//! loop reconnects by itself; handlers stay registered across reconnects.

use crate::msgbus::envelope::{Envelope, Kind};
use crate::transport::{tcp_addr, SubSocket};
use crate::util::Shutdown;
use crossbeam::channel::{unbounded, Receiver};
use std::collections::HashMap;
use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long to wait before reconnecting after a receive error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type Handler = Box<dyn Fn(&Envelope) + Send>;
type StringHandler = Box<dyn Fn(&str) + Send>;

pub struct Subscriber {
    endpoint: String,
    name: Option<String>,
    handlers: HashMap<Kind, Vec<Handler>>,
    string_handlers: Vec<StringHandler>,
}

/// Handle to a started subscriber: join the loop, observe receive errors.
pub struct SubscriberHandle {
    pub errors: Receiver<io::Error>,
    handle: JoinHandle<()>,
}

impl SubscriberHandle {
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

impl Subscriber {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            name: None,
            handlers: HashMap::new(),
            string_handlers: Vec::new(),
        }
    }

    /// Set the subscriber's own module name. Envelopes with this sender are
    /// dropped before dispatch.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Register a handler for one envelope kind. Handlers must not block the
    /// dispatch loop; long work is handed off by the handler itself.
    pub fn on_kind(&mut self, kind: Kind, handler: impl Fn(&Envelope) + Send + 'static) {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn on_status(&mut self, handler: impl Fn(&Envelope) + Send + 'static) {
        self.on_kind(Kind::Status, handler);
    }

    pub fn on_update(&mut self, handler: impl Fn(&Envelope) + Send + 'static) {
        self.on_kind(Kind::Update, handler);
    }

    pub fn on_metric(&mut self, handler: impl Fn(&Envelope) + Send + 'static) {
        self.on_kind(Kind::Metric, handler);
    }

    pub fn on_health_check(&mut self, handler: impl Fn(&Envelope) + Send + 'static) {
        self.on_kind(Kind::HealthCheck, handler);
    }

    pub fn on_module_control(&mut self, handler: impl Fn(&Envelope) + Send + 'static) {
        self.on_kind(Kind::ModuleControl, handler);
    }

    pub fn on_confirmation(&mut self, handler: impl Fn(&Envelope) + Send + 'static) {
        self.on_kind(Kind::Confirmation, handler);
    }

    /// Register a handler for raw string payloads (the LOG topic).
    pub fn on_string(&mut self, handler: impl Fn(&str) + Send + 'static) {
        self.string_handlers.push(Box::new(handler));
    }

    /// Start the receive loop on `topic`. The loop runs until the shutdown
    /// token trips, reconnecting after transient errors.
    pub fn start(self, topic: &str, shutdown: Shutdown) -> io::Result<SubscriberHandle> {
        let addr = tcp_addr(&self.endpoint)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let topic = topic.to_string();
        let (errors_tx, errors) = unbounded();

        let handle = std::thread::Builder::new()
            .name(format!("bus-sub-{topic}"))
            .spawn(move || {
                while !shutdown.is_tripped() {
                    let mut socket = match SubSocket::connect(addr) {
                        Ok(socket) => socket,
                        Err(e) => {
                            let _ = errors_tx.send(e);
                            shutdown.wait_timeout(RECONNECT_DELAY);
                            continue;
                        }
                    };

                    loop {
                        if shutdown.is_tripped() {
                            return;
                        }

                        match socket.recv() {
                            Ok(Some(frame)) => {
                                // This shouldn't ever really happen...
                                if frame.topic != topic {
                                    continue;
                                }

                                self.dispatch(&frame.payload);
                            }
                            Ok(None) => continue,
                            Err(e) => {
                                let _ = errors_tx.send(e);
                                shutdown.wait_timeout(RECONNECT_DELAY);
                                break;
                            }
                        }
                    }
                }
            })?;

        Ok(SubscriberHandle { errors, handle })
    }

    fn dispatch(&self, payload: &[u8]) {
        if !self.string_handlers.is_empty() {
            let msg = String::from_utf8_lossy(payload);
            for handler in &self.string_handlers {
                handler(&msg);
            }
        }

        if self.handlers.is_empty() {
            return;
        }

        let env = match Envelope::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                log::error!("[msgbus] creating envelope from message: {e}");
                return;
            }
        };

        if let Some(name) = &self.name {
            if env.sender() == name {
                return;
            }
        }

        // A kind with no registered handler is dropped.
        if let Some(handlers) = self.handlers.get(&env.kind) {
            for handler in handlers {
                handler(&env);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgbus::envelope::{Point, Status};

    fn frame_for(sender: &str) -> Vec<u8> {
        Envelope::new(
            sender,
            &Status {
                measurements: vec![Point::new("a", 1.0)],
            },
        )
        .unwrap()
        .encode()
        .unwrap()
    }

    #[test]
    fn dispatch_filters_own_sender() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut sub = Subscriber::new("tcp://127.0.0.1:1").with_name("me");
        let counter = seen.clone();
        sub.on_status(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        sub.dispatch(&frame_for("me"));
        sub.dispatch(&frame_for("other"));

        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_runs_handlers_in_registration_order() {
        let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut sub = Subscriber::new("tcp://127.0.0.1:1");
        for i in 0..3 {
            let order = order.clone();
            sub.on_status(move |_| order.lock().push(i));
        }

        sub.dispatch(&frame_for("peer"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn dispatch_drops_unhandled_kinds() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut sub = Subscriber::new("tcp://127.0.0.1:1");
        let counter = seen.clone();
        sub.on_update(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        // Status envelope, but only an Update handler is registered.
        sub.dispatch(&frame_for("peer"));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
