// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus aggregator: one per simulator instance.
//!
//! Binds both bus endpoints and pumps every frame collected on the pull side
//! onto the publish side, giving the deterministic "pub = fan-out of all
//! pushes" model. Frames from a single pusher are forwarded in the order
//! they arrive.

use crate::error::{ConfigError, RuntimeError};
use crate::transport::{FrameCodec, PubServer, PullServer};
use crate::util::Shutdown;
use std::net::SocketAddr;
use std::time::Duration;

pub struct Broker {
    pub_addr: SocketAddr,
    pull_addr: SocketAddr,
}

impl Broker {
    /// Bind both endpoints and start the pump thread.
    pub fn start(
        pub_endpoint: &str,
        pull_endpoint: &str,
        shutdown: Shutdown,
    ) -> Result<Self, RuntimeError> {
        let pub_addr = crate::transport::tcp_addr(pub_endpoint)?;
        let pull_addr = crate::transport::tcp_addr(pull_endpoint)?;

        let pub_server = PubServer::bind(pub_addr, shutdown.clone())
            .map_err(|e| RuntimeError::from(ConfigError::Io(e)))?;
        let (pull_server, frames) = PullServer::bind(pull_addr, shutdown.clone())
            .map_err(|e| RuntimeError::from(ConfigError::Io(e)))?;

        let broker = Self {
            pub_addr: pub_server.local_addr(),
            pull_addr: pull_server.local_addr(),
        };

        std::thread::Builder::new()
            .name("bus-broker".into())
            .spawn(move || {
                log::info!(
                    "[msgbus] broker up (pub {}, pull {})",
                    pub_server.local_addr(),
                    pull_server.local_addr()
                );

                while !shutdown.is_tripped() {
                    match frames.recv_timeout(Duration::from_millis(250)) {
                        Ok(frame) => {
                            let encoded = FrameCodec::encode(&frame.topic, &frame.payload);
                            pub_server.broadcast(&encoded);
                        }
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| RuntimeError::from(ConfigError::Io(e)))?;

        Ok(broker)
    }

    /// Actual bound publish address (useful when configured with port 0).
    pub fn pub_addr(&self) -> SocketAddr {
        self.pub_addr
    }

    /// Actual bound pull address.
    pub fn pull_addr(&self) -> SocketAddr {
        self.pull_addr
    }
}
