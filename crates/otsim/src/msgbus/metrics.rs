// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-module metrics registry with periodic push to the HEALTH topic.

use crate::msgbus::envelope::{Envelope, Metric, MetricKind, Metrics};
use crate::msgbus::pusher::Pusher;
use crate::msgbus::HEALTH_TOPIC;
use crate::util::Shutdown;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Push interval for metric envelopes.
const PUSH_PERIOD: Duration = Duration::from_secs(5);

/// Named Counter/Gauge registry.
///
/// Modules register metrics up front, then increment/set from their wire
/// handlers. A background thread pushes the whole set every 5 seconds,
/// prefixing each metric name with `<module>_`.
#[derive(Clone, Default)]
pub struct MetricsPusher {
    metrics: Arc<Mutex<BTreeMap<String, Metric>>>,
}

impl MetricsPusher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: MetricKind, name: &str, desc: &str) {
        self.metrics.lock().insert(
            name.to_string(),
            Metric {
                kind,
                name: name.to_string(),
                desc: desc.to_string(),
                value: 0.0,
            },
        );
    }

    /// Increment a registered counter by 1. Unregistered names are ignored.
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &str, count: usize) {
        if let Some(metric) = self.metrics.lock().get_mut(name) {
            metric.value += count as f64;
        }
    }

    pub fn set(&self, name: &str, value: f64) {
        if let Some(metric) = self.metrics.lock().get_mut(name) {
            metric.value = value;
        }
    }

    /// Start the push thread for module `name`.
    pub fn start(&self, pusher: Arc<Pusher>, name: &str, shutdown: Shutdown) {
        let metrics = self.metrics.clone();
        let module = name.to_string();
        let prefix = format!("{module}_");
        let thread_name = format!("metrics-{module}");

        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || loop {
                if shutdown.wait_timeout(PUSH_PERIOD) {
                    return;
                }

                let updates: Vec<Metric> = {
                    let metrics = metrics.lock();
                    metrics
                        .values()
                        .map(|metric| {
                            let mut copy = metric.clone();
                            if !copy.name.starts_with(&prefix) {
                                copy.name = format!("{prefix}{}", copy.name);
                            }
                            copy
                        })
                        .collect()
                };

                if updates.is_empty() {
                    continue;
                }

                let env = match Envelope::new(&module, &Metrics { metrics: updates }) {
                    Ok(env) => env,
                    Err(e) => {
                        log::error!("[{module}] creating metric envelope: {e}");
                        continue;
                    }
                };

                if let Err(e) = pusher.push(HEALTH_TOPIC, &env) {
                    log::error!("[{module}] pushing metrics: {e}");
                }
            });

        if let Err(e) = spawned {
            log::error!("[{name}] spawning metrics pusher: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsPusher::new();
        metrics.register(MetricKind::Counter, "status_count", "status messages processed");

        metrics.incr("status_count");
        metrics.incr_by("status_count", 4);

        assert_eq!(metrics.metrics.lock()["status_count"].value, 5.0);
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = MetricsPusher::new();
        metrics.register(MetricKind::Gauge, "connected", "peer link state");

        metrics.set("connected", 1.0);
        metrics.set("connected", 0.0);

        assert_eq!(metrics.metrics.lock()["connected"].value, 0.0);
    }

    #[test]
    fn unregistered_names_are_ignored() {
        let metrics = MetricsPusher::new();
        metrics.incr("nope");
        assert!(metrics.metrics.lock().is_empty());
    }
}
