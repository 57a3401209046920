// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Module lifecycle: registration, configuration, ordered start.
//!
//! A binary registers one factory per XML tag it knows how to host, parses
//! the config, and starts the resulting runners in document order. A runner
//! spawns its long-lived threads and returns; the process then waits on the
//! root shutdown token.

use crate::error::{ConfigError, RuntimeError};
use crate::util::Shutdown;
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything a runner needs to join the simulator: the root cancellation
/// token, the bus endpoints, and the active config path.
///
/// Cloning registers with the process-wide wait group; long-lived module
/// threads move a clone in and drop it on exit, so the process can wait
/// for all of them before exiting.
#[derive(Clone)]
pub struct RunContext {
    pub shutdown: Shutdown,
    pub pub_endpoint: String,
    pub pull_endpoint: String,
    pub config_path: PathBuf,
    pub waiter: crossbeam::sync::WaitGroup,
}

impl RunContext {
    pub fn config_path_str(&self) -> &str {
        self.config_path.to_str().unwrap_or_default()
    }
}

/// A configured simulator module.
pub trait Module: Send {
    fn name(&self) -> &str;

    /// Apply the module's XML element. Called exactly once, before `run`.
    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError>;

    /// Start the module's long-lived work and return. Implementations spawn
    /// their own threads and observe `ctx.shutdown`.
    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError>;
}

/// Builds a module from its XML element (typically just reading a `name`
/// or `mode` attribute).
pub trait ModuleFactory: Send + Sync {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError>;
}

/// Adapter so plain closures can act as factories (used by tests and
/// embedders).
struct FnFactory<F>(F);

impl<F> ModuleFactory for FnFactory<F>
where
    F: Fn(roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> + Send + Sync,
{
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        (self.0)(node)
    }
}

/// Registry mapping XML tags to module factories.
///
/// Constructed once per binary and injected into config parsing. Duplicate
/// registration is a programmer error, not a runtime condition.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Box<dyn ModuleFactory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if `tag` was already registered.
    pub fn register(&mut self, tag: &str, factory: Box<dyn ModuleFactory>) {
        if self.factories.insert(tag.to_string(), factory).is_some() {
            panic!("duplicate module factory registration for tag '{tag}'");
        }
    }

    /// Register a closure as a factory.
    ///
    /// # Panics
    ///
    /// Panics if `tag` was already registered.
    pub fn register_fn<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> + Send + Sync + 'static,
    {
        self.register(tag, Box::new(FnFactory(factory)));
    }

    pub fn get(&self, tag: &str) -> Option<&dyn ModuleFactory> {
        self.factories.get(tag).map(|f| f.as_ref())
    }
}

/// Run every configured module in document order.
///
/// A failing runner aborts startup; the caller maps the error to a process
/// exit code via [`RuntimeError::exit_code`].
pub fn start(modules: &mut [Box<dyn Module>], ctx: &RunContext) -> Result<(), RuntimeError> {
    if modules.is_empty() {
        return Err(RuntimeError::NoRunners);
    }

    for module in modules.iter_mut() {
        log::info!("[{}] starting", module.name());

        if let Err(e) = module.run(ctx) {
            log::error!("[{}] failed to start: {e}", module.name());
            return Err(e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop {
        ran: bool,
    }

    impl Module for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn configure(&mut self, _: roxmltree::Node) -> Result<(), ConfigError> {
            Ok(())
        }

        fn run(&mut self, _: &RunContext) -> Result<(), RuntimeError> {
            self.ran = true;
            Ok(())
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            shutdown: Shutdown::new(),
            pub_endpoint: "tcp://127.0.0.1:5678".into(),
            pull_endpoint: "tcp://127.0.0.1:1234".into(),
            config_path: PathBuf::from("/tmp/config.xml"),
            waiter: crossbeam::sync::WaitGroup::new(),
        }
    }

    #[test]
    fn start_with_no_runners_is_an_error() {
        let mut modules: Vec<Box<dyn Module>> = Vec::new();
        assert!(matches!(
            start(&mut modules, &ctx()),
            Err(RuntimeError::NoRunners)
        ));
    }

    #[test]
    fn start_runs_in_order() {
        let mut modules: Vec<Box<dyn Module>> = vec![
            Box::new(Noop { ran: false }),
            Box::new(Noop { ran: false }),
        ];
        start(&mut modules, &ctx()).unwrap();
    }

    #[test]
    #[should_panic(expected = "duplicate module factory")]
    fn duplicate_registration_panics() {
        let factory = |_: roxmltree::Node| -> Result<Box<dyn Module>, ConfigError> {
            Ok(Box::new(Noop { ran: false }))
        };

        let mut registry = ModuleRegistry::new();
        registry.register_fn("logic", factory);
        registry.register_fn("logic", factory);
    }
}
