// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Prometheus view of the Metric envelopes flowing on the HEALTH topic.
//!
//! Metric names arrive with module prefixes and may contain characters
//! Prometheus rejects; they are sanitized on registration. Counter
//! envelopes carry cumulative values, so only the positive delta since the
//! last push is added.

use crate::msgbus::{Metric, MetricKind, Metrics};
use parking_lot::Mutex;
use prometheus::{Counter, Encoder, Gauge, Registry, TextEncoder};
use std::collections::HashMap;

pub struct PromRegistry {
    registry: Registry,
    counters: Mutex<HashMap<String, (Counter, f64)>>,
    gauges: Mutex<HashMap<String, Gauge>>,
}

impl PromRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one Metric envelope payload.
    pub fn handle(&self, metrics: &Metrics) {
        for metric in &metrics.metrics {
            match metric.kind {
                MetricKind::Counter => self.handle_counter(metric),
                MetricKind::Gauge => self.handle_gauge(metric),
            }
        }
    }

    fn handle_counter(&self, metric: &Metric) {
        let mut counters = self.counters.lock();

        if !counters.contains_key(&metric.name) {
            let counter = match Counter::new(sanitize(&metric.name), help_text(metric)) {
                Ok(counter) => counter,
                Err(e) => {
                    log::warn!("[cpu] invalid counter name {}: {e}", metric.name);
                    return;
                }
            };

            if let Err(e) = self.registry.register(Box::new(counter.clone())) {
                log::warn!("[cpu] registering counter {}: {e}", metric.name);
            }

            counters.insert(metric.name.clone(), (counter, 0.0));
        }

        if let Some((counter, last)) = counters.get_mut(&metric.name) {
            let delta = metric.value - *last;
            if delta > 0.0 {
                counter.inc_by(delta);
            }
            *last = metric.value;
        }
    }

    fn handle_gauge(&self, metric: &Metric) {
        let mut gauges = self.gauges.lock();

        if !gauges.contains_key(&metric.name) {
            let gauge = match Gauge::new(sanitize(&metric.name), help_text(metric)) {
                Ok(gauge) => gauge,
                Err(e) => {
                    log::warn!("[cpu] invalid gauge name {}: {e}", metric.name);
                    return;
                }
            };

            if let Err(e) = self.registry.register(Box::new(gauge.clone())) {
                log::warn!("[cpu] registering gauge {}: {e}", metric.name);
            }

            gauges.insert(metric.name.clone(), gauge);
        }

        if let Some(gauge) = gauges.get(&metric.name) {
            gauge.set(metric.value);
        }
    }

    /// Prometheus text exposition of everything gathered so far.
    pub fn gather(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();

        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            log::error!("[cpu] encoding metrics: {e}");
            return String::new();
        }

        String::from_utf8_lossy(&buf).to_string()
    }
}

impl Default for PromRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | ':' | '.' => '_',
            other => other,
        })
        .collect()
}

fn help_text(metric: &Metric) -> String {
    if metric.desc.is_empty() {
        metric.name.clone()
    } else {
        metric.desc.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(kind: MetricKind, name: &str, value: f64) -> Metrics {
        Metrics {
            metrics: vec![Metric {
                kind,
                name: name.into(),
                desc: "test metric".into(),
                value,
            }],
        }
    }

    #[test]
    fn counters_track_deltas_of_cumulative_values() {
        let registry = PromRegistry::new();

        registry.handle(&metric(MetricKind::Counter, "modbus_coil_writes_count", 3.0));
        registry.handle(&metric(MetricKind::Counter, "modbus_coil_writes_count", 5.0));

        let out = registry.gather();
        assert!(out.contains("modbus_coil_writes_count 5"), "{out}");
    }

    #[test]
    fn gauges_overwrite() {
        let registry = PromRegistry::new();

        registry.handle(&metric(MetricKind::Gauge, "mb.connected", 1.0));
        registry.handle(&metric(MetricKind::Gauge, "mb.connected", 0.0));

        let out = registry.gather();
        assert!(out.contains("mb_connected 0"), "{out}");
    }

    #[test]
    fn names_are_sanitized() {
        let registry = PromRegistry::new();
        registry.handle(&metric(MetricKind::Gauge, "mqtt-client:load.avg", 2.5));

        let out = registry.gather();
        assert!(out.contains("mqtt_client_load_avg 2.5"), "{out}");
    }
}
