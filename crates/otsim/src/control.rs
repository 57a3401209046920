// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client side of the module-control flow.
//!
//! Admin surfaces (Telnet shell, REST API) push ModuleControl envelopes on
//! the INTERNAL topic with a correlation id and wait for the supervisor's
//! Confirmation envelope carrying the same id. Requests time out after five
//! seconds by default.

use crate::error::RuntimeError;
use crate::msgbus::{
    Confirmation, Envelope, ModuleControl, Pusher, Subscriber, INTERNAL_TOPIC,
};
use crate::util::Shutdown;
use crossbeam::channel::{bounded, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default wait for a Confirmation reply.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("sending module control message: {0}")]
    Send(String),

    #[error("request timed out")]
    Timeout,
}

pub struct ControlClient {
    sender: String,
    pusher: Pusher,
    waiters: Arc<DashMap<String, Sender<Confirmation>>>,
}

impl ControlClient {
    /// Connect to the bus and start the Confirmation listener.
    pub fn start(
        pub_endpoint: &str,
        pull_endpoint: &str,
        sender: &str,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, RuntimeError> {
        let pusher = Pusher::connect(pull_endpoint)?;
        let waiters: Arc<DashMap<String, Sender<Confirmation>>> = Arc::default();

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(sender);
        {
            let name = sender.to_string();
            let waiters = waiters.clone();
            subscriber.on_confirmation(move |env| match env.confirmation() {
                Ok(confirmation) => {
                    if let Some((_, waiter)) = waiters.remove(&confirmation.confirm) {
                        let _ = waiter.send(confirmation);
                    }
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting confirmation from envelope: {e}"),
            });
        }
        subscriber
            .start(INTERNAL_TOPIC, shutdown)
            .map_err(RuntimeError::Io)?;

        Ok(Arc::new(Self {
            sender: sender.to_string(),
            pusher,
            waiters,
        }))
    }

    /// Issue a control request and wait for its Confirmation.
    pub fn request(
        &self,
        mut control: ModuleControl,
        timeout: Duration,
    ) -> Result<Confirmation, ControlError> {
        let confirm = Uuid::new_v4().to_string();
        control.confirm = confirm.clone();

        if control.recipient.is_empty() {
            control.recipient = "CPU".to_string();
        }

        let (tx, rx) = bounded(1);
        self.waiters.insert(confirm.clone(), tx);

        let env = Envelope::new(&self.sender, &control)
            .map_err(|e| ControlError::Send(e.to_string()))?;

        if let Err(e) = self.pusher.push(INTERNAL_TOPIC, &env) {
            self.waiters.remove(&confirm);
            return Err(ControlError::Send(e.to_string()));
        }

        let result = rx.recv_timeout(timeout).map_err(|_| ControlError::Timeout);
        self.waiters.remove(&confirm);
        result
    }

    /// List module states (name -> "enabled" / "disabled").
    pub fn list(&self) -> Result<Confirmation, ControlError> {
        self.request(
            ModuleControl {
                list: true,
                ..Default::default()
            },
            CONFIRM_TIMEOUT,
        )
    }

    pub fn enable(&self, names: Vec<String>) -> Result<Confirmation, ControlError> {
        self.request(
            ModuleControl {
                enable: names,
                ..Default::default()
            },
            CONFIRM_TIMEOUT,
        )
    }

    pub fn disable(&self, names: Vec<String>) -> Result<Confirmation, ControlError> {
        self.request(
            ModuleControl {
                disable: names,
                ..Default::default()
            },
            CONFIRM_TIMEOUT,
        )
    }
}
