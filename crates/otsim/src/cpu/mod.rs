// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CPU module: the simulator's host process.
//!
//! Binds the bus aggregator, launches and supervises the configured child
//! modules, monitors the LOG/HEALTH/RUNTIME topics, answers ModuleControl
//! requests on INTERNAL, and serves the REST/WebSocket admin surface.

pub mod api;
pub mod metrics;
pub mod sinks;
pub mod supervisor;

use crate::config::xml;
use crate::control::ControlClient;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{
    Broker, Confirmation, Envelope, HealthCheck, Pusher, Subscriber, HEALTH_TOPIC,
    INTERNAL_TOPIC, LOG_TOPIC, RUNTIME_TOPIC,
};
use crate::runtime::{Module, ModuleFactory, RunContext};
use api::{ApiState, ApiTls};
use dashmap::DashMap;
use metrics::PromRegistry;
use sinks::{ElasticSink, LogBatcher, LogSink, LokiSink};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{OsProcessFactory, Supervisor};

/// Period of the CPU's own HealthCheck heartbeat.
const HEALTH_PERIOD: Duration = Duration::from_secs(30);

pub struct Cpu {
    name: String,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    api_endpoint: Option<String>,
    api_tls: ApiTls,

    /// (name, command line) in configuration order.
    modules: Vec<(String, String)>,

    elastic_endpoint: Option<String>,
    elastic_index: String,
    loki_endpoint: Option<String>,
}

impl Cpu {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pub_endpoint: None,
            pull_endpoint: None,
            api_endpoint: None,
            api_tls: ApiTls::default(),
            modules: Vec::new(),
            elastic_endpoint: None,
            elastic_index: "ot-sim-logs".to_string(),
            loki_endpoint: None,
        }
    }

    fn sinks(&self) -> Vec<Box<dyn LogSink>> {
        let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();

        if let Some(endpoint) = &self.elastic_endpoint {
            sinks.push(Box::new(ElasticSink::new(endpoint, &self.elastic_index)));
        }

        if let Some(endpoint) = &self.loki_endpoint {
            sinks.push(Box::new(LokiSink::new(endpoint)));
        }

        sinks
    }
}

impl Module for Cpu {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "api-endpoint" => {
                    // the api/endpoint element takes precedence
                    if self.api_endpoint.is_none() {
                        self.api_endpoint = Some(xml::text(child).to_string());
                    }
                }
                "api" => {
                    for api in xml::children(child) {
                        let text = xml::text(api).to_string();
                        match api.tag_name().name() {
                            "endpoint" => self.api_endpoint = Some(text),
                            "tls-key" => self.api_tls.key = Some(text),
                            "tls-certificate" => self.api_tls.cert = Some(text),
                            "ca-certificate" => self.api_tls.ca = Some(text),
                            _ => {}
                        }
                    }
                }
                "module" => {
                    let command = xml::text(child).to_string();
                    let name = xml::attr_or(child, "name", &command).to_string();

                    if command.is_empty() {
                        return Err(ConfigError::MissingElement {
                            module: self.name.clone(),
                            element: "module".into(),
                        });
                    }

                    self.modules.push((name, command));
                }
                "logs" => {
                    for logs in xml::children(child) {
                        let text = xml::text(logs).to_string();
                        match logs.tag_name().name() {
                            "elastic-endpoint" => self.elastic_endpoint = Some(text),
                            "elastic-index" => self.elastic_index = text,
                            "loki-endpoint" => self.loki_endpoint = Some(text),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        let pub_endpoint = self
            .pub_endpoint
            .clone()
            .unwrap_or_else(|| ctx.pub_endpoint.clone());
        let pull_endpoint = self
            .pull_endpoint
            .clone()
            .unwrap_or_else(|| ctx.pull_endpoint.clone());

        // The CPU hosts the aggregator: bind before anything connects.
        Broker::start(&pub_endpoint, &pull_endpoint, ctx.shutdown.clone())?;

        let batcher = LogBatcher::start(self.sinks(), ctx.shutdown.clone());

        let supervisor = Arc::new(Supervisor::new(
            &self.name,
            Arc::new(OsProcessFactory),
            batcher,
            ctx.shutdown.clone(),
            ctx.waiter.clone(),
        ));

        for (name, command) in &self.modules {
            supervisor
                .start_module(name, command)
                .map_err(|e| RuntimeError::StartFailed {
                    module: name.clone(),
                    reason: e.to_string(),
                })?;
        }

        let pusher = Arc::new(Pusher::connect(&pull_endpoint)?);
        let prom = Arc::new(PromRegistry::new());

        // Topic monitors.
        {
            let mut logs = Subscriber::new(&pub_endpoint);
            logs.on_string(|msg| log::info!("[LOG] {msg}"));
            logs.start(LOG_TOPIC, ctx.shutdown.clone())
                .map_err(RuntimeError::Io)?;
        }
        {
            let mut health = Subscriber::new(&pub_endpoint);
            let prom = prom.clone();
            health.on_metric(move |env| match env.metrics() {
                Ok(metrics) => prom.handle(&metrics),
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[CPU] getting metrics from envelope: {e}"),
            });
            health.on_health_check(|env| {
                if let Ok(check) = env.health_check() {
                    log::debug!("[CPU] health: {} is {}", env.sender(), check.state);
                }
            });
            health
                .start(HEALTH_TOPIC, ctx.shutdown.clone())
                .map_err(RuntimeError::Io)?;
        }
        {
            let mut runtime = Subscriber::new(&pub_endpoint);
            runtime.on_string(|msg| log::debug!("[RUNTIME] {msg}"));
            runtime
                .start(RUNTIME_TOPIC, ctx.shutdown.clone())
                .map_err(RuntimeError::Io)?;
        }

        // ModuleControl requests on INTERNAL.
        {
            let mut internal = Subscriber::new(&pub_endpoint);
            let cpu_name = self.name.clone();
            let supervisor = supervisor.clone();
            let pusher = pusher.clone();

            internal.on_module_control(move |env| {
                let control = match env.module_control() {
                    Ok(control) => control,
                    Err(e) if e.is_kind_mismatch() => return,
                    Err(e) => {
                        log::error!("[CPU] getting module controls from envelope: {e}");
                        return;
                    }
                };

                if !control.recipient.is_empty()
                    && !control.recipient.eq_ignore_ascii_case("cpu")
                    && control.recipient != cpu_name
                {
                    return;
                }

                let mut results = BTreeMap::new();
                let mut errors = BTreeMap::new();

                if control.list {
                    for (name, state) in supervisor.list() {
                        results.insert(name, state);
                    }
                }

                for name in control.enable {
                    match supervisor.enable(&name) {
                        Ok(()) => {
                            results.insert(name, "enabled".to_string());
                        }
                        Err(e) => {
                            log::error!("[CPU] failed to enable module {name}: {e}");
                            errors.insert(name, e);
                        }
                    }
                }

                for name in control.disable {
                    match supervisor.disable(&name) {
                        Ok(()) => {
                            results.insert(name, "disabled".to_string());
                        }
                        Err(e) => {
                            log::error!("[CPU] failed to disable module {name}: {e}");
                            errors.insert(name, e);
                        }
                    }
                }

                if control.confirm.is_empty() {
                    return;
                }

                let confirmation = Confirmation {
                    confirm: control.confirm,
                    results,
                    errors,
                };

                match Envelope::new(&cpu_name, &confirmation) {
                    Ok(env) => {
                        if let Err(e) = pusher.push(INTERNAL_TOPIC, &env) {
                            log::error!("[CPU] sending module control confirmation: {e}");
                        }
                    }
                    Err(e) => log::error!("[CPU] creating confirmation envelope: {e}"),
                }
            });

            internal
                .start(INTERNAL_TOPIC, ctx.shutdown.clone())
                .map_err(RuntimeError::Io)?;
        }

        // HealthCheck heartbeat.
        {
            let name = self.name.clone();
            let pusher = pusher.clone();
            let shutdown = ctx.shutdown.clone();

            std::thread::Builder::new()
                .name("cpu-health".into())
                .spawn(move || loop {
                    if shutdown.wait_timeout(HEALTH_PERIOD) {
                        return;
                    }

                    let check = HealthCheck {
                        state: "healthy".to_string(),
                    };

                    match Envelope::new(&name, &check) {
                        Ok(env) => {
                            if let Err(e) = pusher.push(HEALTH_TOPIC, &env) {
                                log::error!("[CPU] pushing health check: {e}");
                            }
                        }
                        Err(e) => log::error!("[CPU] creating health check envelope: {e}"),
                    }
                })
                .map_err(RuntimeError::Io)?;
        }

        // Admin surface.
        if let Some(endpoint) = &self.api_endpoint {
            let sender = format!("{}-api", self.name);

            let control = ControlClient::start(
                &pub_endpoint,
                &pull_endpoint,
                &sender,
                ctx.shutdown.clone(),
            )?;

            let state = Arc::new(ApiState {
                points: DashMap::new(),
                pusher: pusher.clone(),
                sender: sender.clone(),
                control,
                prom: prom.clone(),
            });

            {
                let mut runtime = Subscriber::new(&pub_endpoint).with_name(&sender);
                let state = state.clone();
                runtime.on_status(move |env| match env.status() {
                    Ok(status) => {
                        for point in status.measurements {
                            state.points.insert(point.tag.clone(), point);
                        }
                    }
                    Err(e) if e.is_kind_mismatch() => {}
                    Err(e) => log::error!("[CPU] getting status message from envelope: {e}"),
                });
                runtime
                    .start(RUNTIME_TOPIC, ctx.shutdown.clone())
                    .map_err(RuntimeError::Io)?;
            }

            api::serve(
                endpoint.clone(),
                self.api_tls.clone(),
                state,
                ctx.shutdown.clone(),
            )
            .map_err(RuntimeError::Io)?;
        }

        Ok(())
    }
}

/// Factory for the `<cpu>` config element.
pub struct Factory;

impl ModuleFactory for Factory {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        let name = node.attribute("name").unwrap_or("cpu");
        Ok(Box::new(Cpu::new(name)))
    }
}
