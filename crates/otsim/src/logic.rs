// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logic engine module: a periodic expression evaluator.
//!
//! The configured program is an ordered list of `variable = expression`
//! assignments (and bare `sprintf(...)` statements) compiled once and run
//! every tick against a shared variable environment. Variables can be bound
//! to bus tags: after each tick, bound variables are packed into one Status
//! envelope, and the ones whose value changed into one Update envelope.
//! Incoming Status (and optionally Update) envelopes from other senders set
//! bound variables.
//!
//! A single lock guards the environment across the tick and the bus
//! handlers, so a tick is atomic with respect to incoming telemetry.

use crate::config::xml;
use crate::error::{ConfigError, RuntimeError};
use crate::msgbus::{Envelope, Point, Pusher, Status, Subscriber, Update, RUNTIME_TOPIC};
use crate::runtime::{Module, RunContext};
use evalexpr::{
    Context, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function,
    HashMapContext, Node, Value,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One compiled program line.
struct Statement {
    line: usize,
    target: String,
    node: Node,
    /// Bare `sprintf(...)` statement: evaluate and log, never assign.
    print_only: bool,
}

/// Mutable engine state guarded by the environment lock.
struct Env {
    ctx: HashMapContext,
}

pub struct Logic {
    name: String,
    period: Duration,

    pub_endpoint: Option<String>,
    pull_endpoint: Option<String>,

    statements: Vec<Statement>,
    initial: HashMap<String, Value>,

    var_to_tag: HashMap<String, String>,
    tag_to_var: HashMap<String, String>,

    process_updates: bool,
}

impl Logic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            period: Duration::from_secs(1),
            pub_endpoint: None,
            pull_endpoint: None,
            statements: Vec::new(),
            initial: HashMap::new(),
            var_to_tag: HashMap::new(),
            tag_to_var: HashMap::new(),
            process_updates: false,
        }
    }

    fn configure_program(&mut self, text: &str) -> Result<(), ConfigError> {
        for (line, raw) in text.lines().enumerate() {
            let raw = raw.trim();

            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }

            match raw.split_once('=') {
                Some((left, right)) if !right.starts_with('=') => {
                    let target = left.trim().to_string();
                    let source = right.trim();

                    let node = evalexpr::build_operator_tree(source).map_err(|e| {
                        ConfigError::invalid("program", source, format!("compiling line {line}: {e}"))
                    })?;

                    // Initialize the variable unless a variable definition
                    // already did.
                    self.initial
                        .entry(target.clone())
                        .or_insert(Value::Float(0.0));

                    self.statements.push(Statement {
                        line,
                        target,
                        node,
                        print_only: false,
                    });
                }
                _ => {
                    if !raw.starts_with("sprintf") {
                        continue;
                    }

                    let node = evalexpr::build_operator_tree(raw).map_err(|e| {
                        ConfigError::invalid("program", raw, format!("compiling line {line}: {e}"))
                    })?;

                    self.statements.push(Statement {
                        line,
                        target: format!("sprintf{line}"),
                        node,
                        print_only: true,
                    });
                }
            }
        }

        Ok(())
    }

    fn configure_variables(&mut self, node: xml::Node) -> Result<(), ConfigError> {
        for var in xml::children(node) {
            let name = var.tag_name().name().to_string();
            let tag = xml::attr_or(var, "tag", &name).to_string();

            self.var_to_tag.insert(name.clone(), tag.clone());
            self.tag_to_var.insert(tag, name.clone());

            let text = xml::text(var);
            let value = match text.parse::<f64>() {
                Ok(value) => Value::Float(value),
                Err(_) => match text.parse::<bool>() {
                    Ok(value) => Value::Boolean(value),
                    Err(_) => {
                        return Err(ConfigError::invalid(
                            &format!("variables/{name}"),
                            text,
                            "not a double or bool",
                        ))
                    }
                },
            };

            self.initial.insert(name, value);
        }

        Ok(())
    }

    fn build_env(&self) -> Result<Env, RuntimeError> {
        let mut ctx = HashMapContext::new();

        for (name, value) in &self.initial {
            ctx.set_value(name.clone(), value.clone())
                .map_err(|e| RuntimeError::StartFailed {
                    module: self.name.clone(),
                    reason: format!("seeding variable {name}: {e}"),
                })?;
        }

        install_builtins(&mut ctx).map_err(|e| RuntimeError::StartFailed {
            module: self.name.clone(),
            reason: format!("installing built-ins: {e}"),
        })?;

        Ok(Env { ctx })
    }
}

impl Module for Logic {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, node: roxmltree::Node) -> Result<(), ConfigError> {
        for child in xml::children(node) {
            match child.tag_name().name() {
                "pub-endpoint" => self.pub_endpoint = Some(xml::text(child).to_string()),
                "pull-endpoint" => self.pull_endpoint = Some(xml::text(child).to_string()),
                "period" => {
                    let text = xml::text(child);
                    self.period = crate::util::parse_duration(text)
                        .map_err(|e| ConfigError::invalid("period", text, e))?;
                }
                "program" => {
                    let text = child.text().unwrap_or_default();
                    self.configure_program(text)?;
                }
                "variables" => self.configure_variables(child)?,
                "process-updates" => {
                    let text = xml::text(child);
                    self.process_updates = text.parse().map_err(|_| {
                        ConfigError::invalid("process-updates", text, "not a bool")
                    })?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> Result<(), RuntimeError> {
        if self.statements.is_empty() {
            return Err(RuntimeError::StartFailed {
                module: self.name.clone(),
                reason: "no logic program to execute".into(),
            });
        }

        let pub_endpoint = self.pub_endpoint.as_deref().unwrap_or(&ctx.pub_endpoint);
        let pull_endpoint = self.pull_endpoint.as_deref().unwrap_or(&ctx.pull_endpoint);

        let pusher = Pusher::connect(pull_endpoint)?;
        let env = Arc::new(Mutex::new(self.build_env()?));

        let mut subscriber = Subscriber::new(pub_endpoint).with_name(&self.name);

        {
            let name = self.name.clone();
            let env = env.clone();
            let tag_to_var = self.tag_to_var.clone();
            subscriber.on_status(move |envelope| match envelope.status() {
                Ok(status) => {
                    apply_points(&name, &env, &tag_to_var, &status.measurements);
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting status message from envelope: {e}"),
            });
        }

        if self.process_updates {
            let name = self.name.clone();
            let env = env.clone();
            let tag_to_var = self.tag_to_var.clone();
            subscriber.on_update(move |envelope| match envelope.update() {
                Ok(update) => {
                    apply_points(&name, &env, &tag_to_var, &update.updates);
                }
                Err(e) if e.is_kind_mismatch() => {}
                Err(e) => log::error!("[{name}] getting update message from envelope: {e}"),
            });
        }

        subscriber
            .start(RUNTIME_TOPIC, ctx.shutdown.clone())
            .map_err(RuntimeError::Io)?;

        let name = self.name.clone();
        let module = std::mem::replace(self, Logic::new(&name));
        let shutdown = ctx.shutdown.clone();

        std::thread::Builder::new()
            .name(format!("logic-{name}"))
            .spawn(move || loop {
                if shutdown.wait_timeout(module.period) {
                    return;
                }

                module.tick(&env, &pusher);
            })
            .map_err(RuntimeError::Io)?;

        Ok(())
    }
}

impl Logic {
    /// One evaluation pass: run every statement in declared order, then
    /// publish bound variables. Holds the environment lock for the whole
    /// pass.
    fn tick(&self, env: &Arc<Mutex<Env>>, pusher: &Pusher) {
        let mut env = env.lock();
        let mut updated: Vec<String> = Vec::new();

        for stmt in &self.statements {
            let result = match stmt.node.eval_with_context(&env.ctx) {
                Ok(result) => result,
                Err(e) => {
                    log::error!("[{}] running program code: {e}", self.name);
                    continue;
                }
            };

            if stmt.print_only {
                log::info!(
                    "[{}] PROGRAM OUTPUT (line {}): {}",
                    self.name,
                    stmt.line,
                    display_value(&result)
                );
                continue;
            }

            if env.ctx.get_value(&stmt.target) != Some(&result) {
                updated.push(stmt.target.clone());
            }

            if let Err(e) = env.ctx.set_value(stmt.target.clone(), result) {
                log::error!("[{}] storing result for {}: {e}", self.name, stmt.target);
            }
        }

        let status_points = self.pack_points(&env, self.statements.iter().filter_map(|s| {
            if s.print_only {
                None
            } else {
                Some(s.target.as_str())
            }
        }));

        if !status_points.is_empty() {
            let status = Status {
                measurements: status_points,
            };

            match Envelope::new(&self.name, &status) {
                Ok(envelope) => {
                    if let Err(e) = pusher.push(RUNTIME_TOPIC, &envelope) {
                        log::error!("[{}] sending status message: {e}", self.name);
                    }
                }
                Err(e) => log::error!("[{}] creating new status message: {e}", self.name),
            }
        }

        if !updated.is_empty() {
            let update_points = self.pack_points(&env, updated.iter().map(String::as_str));

            if !update_points.is_empty() {
                let update = Update {
                    updates: update_points,
                    ..Default::default()
                };

                match Envelope::new(&self.name, &update) {
                    Ok(envelope) => {
                        if let Err(e) = pusher.push(RUNTIME_TOPIC, &envelope) {
                            log::error!("[{}] sending update message: {e}", self.name);
                        }
                    }
                    Err(e) => log::error!("[{}] creating new update message: {e}", self.name),
                }
            }
        }
    }

    /// Map variables to their bound tags, deduplicating on tag name.
    fn pack_points<'a>(
        &self,
        env: &parking_lot::MutexGuard<'_, Env>,
        vars: impl Iterator<Item = &'a str>,
    ) -> Vec<Point> {
        let mut by_tag: HashMap<&str, Point> = HashMap::new();

        for var in vars {
            let Some(tag) = self.var_to_tag.get(var) else {
                continue;
            };

            let Some(value) = env.ctx.get_value(var).and_then(numeric) else {
                continue;
            };

            by_tag.insert(tag, Point::new(tag, value));
        }

        by_tag.into_values().collect()
    }
}

fn apply_points(
    name: &str,
    env: &Arc<Mutex<Env>>,
    tag_to_var: &HashMap<String, String>,
    points: &[Point],
) {
    let mut env = env.lock();

    for point in points {
        if let Some(var) = tag_to_var.get(&point.tag) {
            log::debug!("[{name}] setting tag {} to value {}", point.tag, point.value);

            if let Err(e) = env.ctx.set_value(var.clone(), Value::Float(point.value)) {
                log::error!("[{name}] setting variable {var}: {e}");
            }
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Float(v) => Some(*v),
        Value::Int(v) => Some(*v as f64),
        Value::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Install the `randInt`, `randFloat`, `randBool`, and `sprintf` built-ins.
fn install_builtins(ctx: &mut HashMapContext) -> Result<(), EvalexprError> {
    ctx.set_function(
        "randInt".into(),
        Function::new(|argument| {
            let max = argument.as_number()?;
            if max <= 0.0 {
                return Ok(Value::Float(0.0));
            }
            let value = rand::thread_rng().gen_range(0.0..max).floor();
            Ok(Value::Float(value))
        }),
    )?;

    ctx.set_function(
        "randFloat".into(),
        Function::new(|_| Ok(Value::Float(rand::thread_rng().gen::<f64>()))),
    )?;

    ctx.set_function(
        "randBool".into(),
        Function::new(|argument| {
            let likely = argument.as_number()?;
            Ok(Value::Boolean(rand::thread_rng().gen::<f64>() >= 1.0 - likely))
        }),
    )?;

    ctx.set_function(
        "sprintf".into(),
        Function::new(|argument| {
            let (format, args) = match argument {
                Value::Tuple(values) => {
                    let format = values
                        .first()
                        .and_then(|v| v.as_string().ok())
                        .ok_or_else(|| {
                            EvalexprError::CustomMessage(
                                "sprintf requires a format string".into(),
                            )
                        })?;
                    (format, values[1..].to_vec())
                }
                Value::String(format) => (format.clone(), Vec::new()),
                _ => {
                    return Err(EvalexprError::CustomMessage(
                        "sprintf requires a format string".into(),
                    ))
                }
            };

            Ok(Value::String(sprintf(&format, &args)))
        }),
    )?;

    Ok(())
}

/// printf-style formatting for the `%d`, `%f`, `%s`, `%v`, and `%%` verbs.
fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    let mut next = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') => match next.next().and_then(|v| numeric(v)) {
                Some(value) => out.push_str(&format!("{}", value as i64)),
                None => out.push_str("%!d"),
            },
            Some('f') => match next.next().and_then(|v| numeric(v)) {
                Some(value) => out.push_str(&format!("{value:.6}")),
                None => out.push_str("%!f"),
            },
            Some('s') | Some('v') => match next.next() {
                Some(value) => out.push_str(&display_value(value)),
                None => out.push_str("%!s"),
            },
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

/// Factory for the `<logic>` config element.
pub struct Factory;

impl crate::runtime::ModuleFactory for Factory {
    fn new_module(&self, node: roxmltree::Node) -> Result<Box<dyn Module>, ConfigError> {
        let name = node.attribute("name").unwrap_or("logic");
        Ok(Box::new(Logic::new(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml_text: &str) -> Logic {
        let doc = roxmltree::Document::parse(xml_text).unwrap();
        let mut logic = Logic::new("logic");
        logic.configure(doc.root_element()).unwrap();
        logic
    }

    fn tick_once(logic: &Logic) -> parking_lot::Mutex<Env> {
        let env = logic.build_env().unwrap();
        let env = parking_lot::Mutex::new(env);

        let mut guard = env.lock();
        for stmt in &logic.statements {
            if stmt.print_only {
                continue;
            }
            let result = stmt.node.eval_with_context(&guard.ctx).unwrap();
            guard.ctx.set_value(stmt.target.clone(), result).unwrap();
        }
        drop(guard);

        env
    }

    #[test]
    fn program_compiles_in_order() {
        let logic = parse(
            r#"<logic>
                 <program>
                   # a comment
                   x = y + 1.0
                   z = x * 2.0
                 </program>
                 <variables><y>2</y></variables>
               </logic>"#,
        );

        assert_eq!(logic.statements.len(), 2);
        assert_eq!(logic.statements[0].target, "x");
        assert_eq!(logic.statements[1].target, "z");
    }

    #[test]
    fn assignments_see_earlier_results() {
        let logic = parse(
            r#"<logic>
                 <program>
                   x = y + 1.0
                   z = x * 2.0
                 </program>
                 <variables><y>2</y></variables>
               </logic>"#,
        );

        let env = tick_once(&logic);
        let guard = env.lock();

        assert_eq!(guard.ctx.get_value("x"), Some(&Value::Float(3.0)));
        assert_eq!(guard.ctx.get_value("z"), Some(&Value::Float(6.0)));
    }

    #[test]
    fn variables_bind_tags_both_ways() {
        let logic = parse(
            r#"<logic>
                 <program>x = x + 1.0</program>
                 <variables><x tag="x.out">0</x></variables>
               </logic>"#,
        );

        assert_eq!(logic.var_to_tag["x"], "x.out");
        assert_eq!(logic.tag_to_var["x.out"], "x");
    }

    #[test]
    fn bool_variables_parse() {
        let logic = parse(
            r#"<logic>
                 <program>x = 1.0</program>
                 <variables><closed>true</closed></variables>
               </logic>"#,
        );

        assert_eq!(logic.initial["closed"], Value::Boolean(true));
    }

    #[test]
    fn bad_variable_value_is_config_error() {
        let doc = roxmltree::Document::parse(
            r#"<logic><variables><x>not-a-number</x></variables></logic>"#,
        )
        .unwrap();

        let mut logic = Logic::new("logic");
        assert!(logic.configure(doc.root_element()).is_err());
    }

    #[test]
    fn builtins_are_callable() {
        let logic = parse(
            r#"<logic>
                 <program>
                   r = randInt(10.0)
                   f = randFloat()
                   b = randBool(1.0)
                 </program>
               </logic>"#,
        );

        let env = tick_once(&logic);
        let guard = env.lock();

        let r = numeric(guard.ctx.get_value("r").unwrap()).unwrap();
        assert!((0.0..10.0).contains(&r));

        let f = numeric(guard.ctx.get_value("f").unwrap()).unwrap();
        assert!((0.0..1.0).contains(&f));

        // likelihood 1.0 always fires
        assert_eq!(guard.ctx.get_value("b"), Some(&Value::Boolean(true)));
    }

    #[test]
    fn sprintf_formats_verbs() {
        let args = [Value::Float(3.5), Value::String("load".into())];
        assert_eq!(sprintf("%s = %f", &[args[1].clone(), args[0].clone()]), "load = 3.500000");
        assert_eq!(sprintf("%d%%", &[Value::Float(42.9)]), "42%");
        assert_eq!(sprintf("no args", &[]), "no args");
        assert_eq!(sprintf("%d", &[]), "%!d");
    }

    #[test]
    fn missing_program_fails_run() {
        let mut logic = parse("<logic><variables><x>1</x></variables></logic>");

        let ctx = RunContext {
            shutdown: crate::util::Shutdown::new(),
            pub_endpoint: "tcp://127.0.0.1:1".into(),
            pull_endpoint: "tcp://127.0.0.1:1".into(),
            config_path: std::path::PathBuf::new(),
            waiter: crossbeam::sync::WaitGroup::new(),
        };

        assert!(logic.run(&ctx).is_err());
    }
}
