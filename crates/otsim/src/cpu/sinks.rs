// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! External log sinks for child-process output.
//!
//! Lines scanned from child stdout/stderr are batched (10 lines, or a
//! 2-second flush) and posted to each configured sink. A failed post is
//! logged and the batch dropped; log shipping never blocks or restarts a
//! module.

use crate::util::Shutdown;
use crossbeam::channel::{unbounded, Sender};
use serde_json::json;
use std::time::Duration;

/// Lines per batch posted to external sinks.
const BATCH_SIZE: usize = 10;

/// Flush interval for partial batches.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LogLine {
    pub module: String,
    pub line: String,
    pub error_stream: bool,
    /// Unix timestamp in nanoseconds, as Loki expects.
    pub tstamp_ns: i128,
}

impl LogLine {
    pub fn new(module: &str, line: String, error_stream: bool) -> Self {
        let tstamp_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);

        Self {
            module: module.to_string(),
            line,
            error_stream,
            tstamp_ns,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn name(&self) -> &str;
    fn post(&self, lines: &[LogLine]) -> Result<(), String>;
}

/// Elasticsearch `_bulk` sink.
pub struct ElasticSink {
    endpoint: String,
    index: String,
    client: reqwest::blocking::Client,
}

impl ElasticSink {
    pub fn new(endpoint: &str, index: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index: index.to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl LogSink for ElasticSink {
    fn name(&self) -> &str {
        "elastic"
    }

    fn post(&self, lines: &[LogLine]) -> Result<(), String> {
        let mut body = String::new();

        for line in lines {
            let action = json!({"index": {"_index": self.index}});
            let doc = json!({
                "@timestamp": (line.tstamp_ns / 1_000_000) as i64,
                "module": line.module,
                "stream": if line.error_stream { "stderr" } else { "stdout" },
                "message": line.line,
            });

            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }

        let resp = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("bulk post returned {}", resp.status()));
        }

        Ok(())
    }
}

/// Grafana Loki push sink.
pub struct LokiSink {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl LokiSink {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl LogSink for LokiSink {
    fn name(&self) -> &str {
        "loki"
    }

    fn post(&self, lines: &[LogLine]) -> Result<(), String> {
        let mut streams = Vec::with_capacity(lines.len());

        for line in lines {
            streams.push(json!({
                "stream": {
                    "job": "ot-sim",
                    "module": line.module,
                    "stream": if line.error_stream { "stderr" } else { "stdout" },
                },
                "values": [[line.tstamp_ns.to_string(), line.line]],
            }));
        }

        let resp = self
            .client
            .post(format!("{}/loki/api/v1/push", self.endpoint))
            .json(&json!({"streams": streams}))
            .send()
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("push returned {}", resp.status()));
        }

        Ok(())
    }
}

/// Batches lines and fans each full batch out to every sink.
#[derive(Clone)]
pub struct LogBatcher {
    tx: Option<Sender<LogLine>>,
}

impl LogBatcher {
    /// A batcher with no sinks drops everything (local logging still
    /// happens at the scanner).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn start(sinks: Vec<Box<dyn LogSink>>, shutdown: Shutdown) -> Self {
        if sinks.is_empty() {
            return Self::disabled();
        }

        let (tx, rx) = unbounded::<LogLine>();

        let spawned = std::thread::Builder::new()
            .name("log-batcher".into())
            .spawn(move || {
                let mut batch: Vec<LogLine> = Vec::with_capacity(BATCH_SIZE);

                loop {
                    crossbeam::select! {
                        recv(shutdown.channel()) -> _ => {
                            Self::flush(&sinks, &mut batch);
                            return;
                        }
                        recv(rx) -> line => {
                            let Ok(line) = line else {
                                Self::flush(&sinks, &mut batch);
                                return;
                            };

                            batch.push(line);

                            if batch.len() >= BATCH_SIZE {
                                Self::flush(&sinks, &mut batch);
                            }
                        }
                        default(FLUSH_INTERVAL) => {
                            Self::flush(&sinks, &mut batch);
                        }
                    }
                }
            });

        if let Err(e) = spawned {
            log::error!("[cpu] spawning log batcher: {e}");
            return Self::disabled();
        }

        Self { tx: Some(tx) }
    }

    fn flush(sinks: &[Box<dyn LogSink>], batch: &mut Vec<LogLine>) {
        if batch.is_empty() {
            return;
        }

        for sink in sinks {
            if let Err(e) = sink.post(batch) {
                // Dropped by design: log shipping is best-effort.
                log::warn!("[cpu] posting {} lines to {}: {e}", batch.len(), sink.name());
            }
        }

        batch.clear();
    }

    pub fn forward(&self, line: LogLine) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Capture {
        batches: Arc<Mutex<Vec<usize>>>,
    }

    impl LogSink for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn post(&self, lines: &[LogLine]) -> Result<(), String> {
            self.batches.lock().push(lines.len());
            Ok(())
        }
    }

    #[test]
    fn batches_flush_at_size() {
        let batches: Arc<Mutex<Vec<usize>>> = Arc::default();
        let shutdown = Shutdown::new();

        let batcher = LogBatcher::start(
            vec![Box::new(Capture {
                batches: batches.clone(),
            })],
            shutdown.clone(),
        );

        for i in 0..BATCH_SIZE {
            batcher.forward(LogLine::new("logic", format!("line {i}"), false));
        }

        // Wait for the batcher thread to pick the batch up.
        for _ in 0..50 {
            if !batches.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(batches.lock().first(), Some(&BATCH_SIZE));
        shutdown.trip();
    }

    #[test]
    fn disabled_batcher_drops_quietly() {
        let batcher = LogBatcher::disabled();
        batcher.forward(LogLine::new("logic", "line".into(), false));
    }
}
