// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket plumbing for the message bus.
//!
//! One process per simulator acts as the aggregator: it binds the publish
//! endpoint (broadcast to every connected subscriber) and the pull endpoint
//! (collect from every connected pusher). All other participants connect.
//!
//! Everything here is plain blocking TCP with short read timeouts so
//! long-lived threads can observe the shutdown token.

mod frame;

pub use frame::{Frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};

use crate::error::ConfigError;
use crate::util::Shutdown;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval for accept loops and socket reads.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a broadcast write may block on one subscriber before that
/// subscriber is dropped. Keeps one slow peer from stalling fan-out to
/// everyone else.
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on frames queued between the pull side and the pump. Overload
/// sheds the newest frames instead of growing without limit.
const PULL_QUEUE_CAP: usize = 1024;

/// Resolve a bus endpoint URL of the form `tcp://host:port` (the bare
/// `host:port` form is also accepted) to a socket address.
pub fn tcp_addr(endpoint: &str) -> Result<SocketAddr, ConfigError> {
    let rest = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(ConfigError::InvalidEndpoint(endpoint.to_string())),
        None => endpoint,
    };

    rest.to_socket_addrs()
        .map_err(|_| ConfigError::InvalidEndpoint(endpoint.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::InvalidEndpoint(endpoint.to_string()))
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_ready(listener: &TcpListener) -> io::Result<Option<TcpStream>> {
    match listener.accept() {
        Ok((stream, _)) => Ok(Some(stream)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Broadcast side of the aggregator: every frame handed to
/// [`PubServer::broadcast`] is written to all connected subscribers.
///
/// Fan-out is lossy toward broken or slow peers: a subscriber whose write
/// fails, or whose receive window stays full past the write timeout, is
/// dropped rather than allowed to stall the broadcast loop.
pub struct PubServer {
    subscribers: Arc<Mutex<Vec<TcpStream>>>,
    local_addr: SocketAddr,
}

impl PubServer {
    pub fn bind(addr: SocketAddr, shutdown: Shutdown) -> io::Result<Self> {
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let subscribers: Arc<Mutex<Vec<TcpStream>>> = Arc::default();

        let accepted = subscribers.clone();
        std::thread::Builder::new()
            .name("bus-pub-accept".into())
            .spawn(move || {
                while !shutdown.is_tripped() {
                    match accept_ready(&listener) {
                        Ok(Some(stream)) => {
                            let _ = stream.set_nodelay(true);
                            let _ = stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT));
                            accepted.lock().push(stream);
                        }
                        Ok(None) => {
                            shutdown.wait_timeout(POLL_INTERVAL);
                        }
                        Err(e) => {
                            log::warn!("[bus] accepting subscriber: {e}");
                            shutdown.wait_timeout(POLL_INTERVAL);
                        }
                    }
                }
            })?;

        Ok(Self {
            subscribers,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Write an already-encoded frame to every subscriber, in connection
    /// order. Two frames broadcast back-to-back arrive in order at every
    /// subscriber because each write happens under the same lock.
    ///
    /// A write timeout (subscriber not draining its socket) counts as a
    /// failure and drops the subscriber; its stream is mid-frame at that
    /// point and useless anyway.
    pub fn broadcast(&self, frame: &[u8]) {
        let mut subs = self.subscribers.lock();
        subs.retain_mut(|stream| match stream.write_all(frame) {
            Ok(()) => true,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                log::warn!("[bus] dropping slow subscriber: {e}");
                false
            }
            Err(e) => {
                log::debug!("[bus] dropping subscriber: {e}");
                false
            }
        });
    }
}

/// Collect side of the aggregator: frames pushed by any connected pusher are
/// funneled into a single bounded channel in arrival order.
///
/// When the consumer falls behind and the queue fills, new frames are
/// dropped (lossy for the pushers) instead of queuing without bound.
pub struct PullServer {
    local_addr: SocketAddr,
}

impl PullServer {
    pub fn bind(addr: SocketAddr, shutdown: Shutdown) -> io::Result<(Self, Receiver<Frame>)> {
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = bounded(PULL_QUEUE_CAP);

        let accept_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("bus-pull-accept".into())
            .spawn(move || {
                while !accept_shutdown.is_tripped() {
                    match accept_ready(&listener) {
                        Ok(Some(stream)) => {
                            Self::spawn_reader(stream, tx.clone(), accept_shutdown.clone());
                        }
                        Ok(None) => {
                            accept_shutdown.wait_timeout(POLL_INTERVAL);
                        }
                        Err(e) => {
                            log::warn!("[bus] accepting pusher: {e}");
                            accept_shutdown.wait_timeout(POLL_INTERVAL);
                        }
                    }
                }
            })?;

        Ok((Self { local_addr }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn spawn_reader(mut stream: TcpStream, tx: Sender<Frame>, shutdown: Shutdown) {
        let _ = stream.set_read_timeout(Some(POLL_INTERVAL));

        let spawned = std::thread::Builder::new()
            .name("bus-pull-conn".into())
            .spawn(move || {
                let mut codec = FrameCodec::with_default_max();

                while !shutdown.is_tripped() {
                    match codec.decode(&mut stream) {
                        Ok(Some(frame)) => {
                            // Lossy on overload: drop the frame when the
                            // queue is full rather than block the pusher.
                            match tx.try_send(frame) {
                                Ok(()) => {}
                                Err(TrySendError::Full(frame)) => {
                                    log::debug!(
                                        "[bus] pull queue full, dropping {} frame",
                                        frame.topic
                                    );
                                }
                                Err(TrySendError::Disconnected(_)) => return,
                            }
                        }
                        Ok(None) => continue,
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
                        Err(e) => {
                            log::debug!("[bus] pusher connection error: {e}");
                            return;
                        }
                    }
                }
            });

        if let Err(e) = spawned {
            log::warn!("[bus] spawning pusher reader: {e}");
        }
    }
}

/// Client side of the pull endpoint: connect once, then send frames.
/// Send failures are returned to the caller; there is no retry.
pub struct PushSocket {
    stream: Mutex<TcpStream>,
}

impl PushSocket {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    pub fn send(&self, topic: &str, payload: &[u8]) -> io::Result<()> {
        let frame = FrameCodec::encode(topic, payload);
        self.stream.lock().write_all(&frame)
    }
}

/// Client side of the publish endpoint: connect once, then receive frames.
pub struct SubSocket {
    stream: TcpStream,
    codec: FrameCodec,
}

impl SubSocket {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            stream,
            codec: FrameCodec::with_default_max(),
        })
    }

    /// Receive the next frame. `Ok(None)` means the read timed out; callers
    /// should check for shutdown and try again.
    pub fn recv(&mut self) -> io::Result<Option<Frame>> {
        self.codec.decode(&mut self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_addr_parsing() {
        assert!(tcp_addr("tcp://127.0.0.1:5555").is_ok());
        assert!(tcp_addr("127.0.0.1:5555").is_ok());
        assert!(tcp_addr("ipc:///tmp/sock").is_err());
        assert!(tcp_addr("tcp://").is_err());
    }

    #[test]
    fn test_push_pull_roundtrip() {
        let shutdown = Shutdown::new();
        let addr = tcp_addr("127.0.0.1:0").unwrap();
        let (pull, rx) = PullServer::bind(addr, shutdown.clone()).unwrap();

        let push = PushSocket::connect(pull.local_addr()).unwrap();
        push.send("RUNTIME", b"payload").unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.topic, "RUNTIME");
        assert_eq!(frame.payload, b"payload");

        shutdown.trip();
    }

    #[test]
    fn test_pull_queue_drops_on_full() {
        let shutdown = Shutdown::new();
        let addr = tcp_addr("127.0.0.1:0").unwrap();
        let (pull, rx) = PullServer::bind(addr, shutdown.clone()).unwrap();

        let push = PushSocket::connect(pull.local_addr()).unwrap();

        // Nothing consumes the queue, so everything past the cap is shed.
        for i in 0..PULL_QUEUE_CAP + 512 {
            push.send("RUNTIME", format!("frame {i}").as_bytes()).unwrap();
        }

        for _ in 0..200 {
            if rx.len() == PULL_QUEUE_CAP {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        assert_eq!(rx.len(), PULL_QUEUE_CAP);

        // Let the reader finish shedding the tail before draining, so none
        // of it can slip into the space we free up.
        std::thread::sleep(Duration::from_millis(500));

        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, PULL_QUEUE_CAP);
        assert!(rx.is_empty());

        shutdown.trip();
    }

    #[test]
    fn test_pub_fan_out() {
        let shutdown = Shutdown::new();
        let addr = tcp_addr("127.0.0.1:0").unwrap();
        let pub_srv = PubServer::bind(addr, shutdown.clone()).unwrap();

        let mut sub_a = SubSocket::connect(pub_srv.local_addr()).unwrap();
        let mut sub_b = SubSocket::connect(pub_srv.local_addr()).unwrap();

        // Wait for the accept loop to pick both up.
        for _ in 0..50 {
            if pub_srv.subscriber_count() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(pub_srv.subscriber_count(), 2);

        pub_srv.broadcast(&FrameCodec::encode("HEALTH", b"x"));

        for sub in [&mut sub_a, &mut sub_b] {
            let frame = loop {
                if let Some(frame) = sub.recv().unwrap() {
                    break frame;
                }
            };
            assert_eq!(frame.topic, "HEALTH");
        }

        shutdown.trip();
    }
}
