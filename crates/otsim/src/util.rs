// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Small shared runtime utilities: the root cancellation token, config-path
//! interpolation, and clock helpers.

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Cooperative cancellation token observed by every long-lived thread.
///
/// Tripping the token closes an internal channel, so blocked waiters wake
/// immediately and `select!` arms on [`Shutdown::channel`] fire. Cloning is
/// cheap; all clones observe the same state.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    /// Token tripped by SIGTERM or SIGINT.
    pub fn from_signals() -> io::Result<Self> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let shutdown = Self::new();
        let mut signals = Signals::new([SIGTERM, SIGINT])?;

        let inner = shutdown.clone();
        std::thread::Builder::new()
            .name("signal-watcher".into())
            .spawn(move || {
                if signals.forever().next().is_some() {
                    log::info!("termination signal received, shutting down");
                    inner.trip();
                }
            })?;

        Ok(shutdown)
    }

    /// Trip the token. Idempotent.
    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Dropping the only sender closes the channel and wakes all waiters.
        self.tx.lock().take();
    }

    pub fn is_tripped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Block until the token trips.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Wait up to `timeout`; returns true if the token tripped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => true,
            _ => self.is_tripped(),
        }
    }

    /// Receiver usable in `crossbeam::select!` arms. The channel never
    /// yields a value; it errors out (closed) once the token trips.
    pub fn channel(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace every `{{config_file}}` occurrence with the active config path.
pub fn interpolate_config_path(text: &str, config_path: &str) -> String {
    text.replace("{{config_file}}", config_path)
}

/// Current wall-clock time as unsigned epoch seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parse a human duration of the form `500ms`, `5s`, `2m`, `1h` (Go-style,
/// as used throughout the XML config).
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();

    let (value, unit) = match text.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => text.split_at(idx),
        None => return Err(format!("missing unit in duration '{text}'")),
    };

    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{text}'"))?;

    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("unknown duration unit '{unit}'")),
    };

    if secs < 0.0 {
        return Err(format!("negative duration '{text}'"));
    }

    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();

        let handle = std::thread::spawn(move || {
            other.wait();
            other.is_tripped()
        });

        std::thread::sleep(Duration::from_millis(50));
        shutdown.trip();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn shutdown_wait_timeout() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
        shutdown.trip();
        assert!(shutdown.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn interpolation_replaces_all_occurrences() {
        let out = interpolate_config_path("a {{config_file}} b {{config_file}}", "/etc/dev.xml");
        assert_eq!(out, "a /etc/dev.xml b /etc/dev.xml");
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("xs").is_err());
    }
}
