// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Push side of the bus: connect to the aggregator's pull endpoint and send
//! topic-tagged envelopes (or free-form strings on the LOG topic).

use crate::error::ConfigError;
use crate::msgbus::envelope::{Envelope, EnvelopeError};
use crate::transport::{tcp_addr, PushSocket};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("encoding envelope for topic {topic}: {source}")]
    Encode {
        topic: String,
        source: EnvelopeError,
    },

    #[error("sending to topic {topic}: {source}")]
    Send { topic: String, source: io::Error },
}

/// Bus pusher. Send failures are returned to the caller; no retry.
pub struct Pusher {
    socket: PushSocket,
}

impl Pusher {
    pub fn connect(endpoint: &str) -> Result<Self, ConfigError> {
        let addr = tcp_addr(endpoint)?;
        let socket = PushSocket::connect(addr)?;
        Ok(Self { socket })
    }

    pub fn push(&self, topic: &str, env: &Envelope) -> Result<(), PushError> {
        let body = env.encode().map_err(|source| PushError::Encode {
            topic: topic.to_string(),
            source,
        })?;

        self.socket
            .send(topic, &body)
            .map_err(|source| PushError::Send {
                topic: topic.to_string(),
                source,
            })
    }

    /// Push a free-form string; used for the LOG topic.
    pub fn push_string(&self, topic: &str, msg: &str) -> Result<(), PushError> {
        self.socket
            .send(topic, msg.as_bytes())
            .map_err(|source| PushError::Send {
                topic: topic.to_string(),
                source,
            })
    }
}
