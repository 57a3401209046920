// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Child-process supervision.
//!
//! Each external module runs under a supervision thread that restarts it
//! when it dies, honoring the no-restart exit code contract:
//!
//! - exit code 101: crashed, do not relaunch
//! - any other exit: log and relaunch
//! - cancellation: SIGTERM, then SIGKILL after 10 seconds
//! - disable request: SIGTERM as above, no relaunch
//!
//! Process side-effects sit behind [`ProcessFactory`] so tests drive the
//! policy with scripted processes instead of real children.

use super::sinks::{LogBatcher, LogLine};
use crate::error::EXIT_NO_RESTART;
use crate::util::Shutdown;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Signal delivery to a running child, usable while another thread blocks
/// in `wait`.
pub trait ProcessSignal: Send + Sync {
    fn terminate(&self);
    fn kill(&self);
}

/// One spawned child process.
pub trait ProcessHandle: Send {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;
    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;
    fn signal(&self) -> Arc<dyn ProcessSignal>;

    /// Block until the child exits; returns its exit code.
    fn wait(self: Box<Self>) -> io::Result<i32>;
}

pub trait ProcessFactory: Send + Sync {
    fn spawn(&self, exe: &Path, args: &[String]) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Real fork/exec factory: inherits the parent environment, pipes both
/// output streams.
pub struct OsProcessFactory;

struct OsSignal {
    pid: i32,
}

impl ProcessSignal for OsSignal {
    fn terminate(&self) {
        unsafe {
            libc::kill(self.pid, libc::SIGTERM);
        }
    }

    fn kill(&self) {
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
    }
}

struct OsProcess {
    child: std::process::Child,
}

impl ProcessHandle for OsProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn signal(&self) -> Arc<dyn ProcessSignal> {
        Arc::new(OsSignal {
            pid: self.child.id() as i32,
        })
    }

    fn wait(mut self: Box<Self>) -> io::Result<i32> {
        let status = self.child.wait()?;
        Ok(status.code().unwrap_or(1))
    }
}

impl ProcessFactory for OsProcessFactory {
    fn spawn(&self, exe: &Path, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        let child = std::process::Command::new(exe)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        Ok(Box::new(OsProcess { child }))
    }
}

/// Resolve a command name against PATH (absolute and relative paths are
/// checked directly).
pub fn resolve_executable(path: &str) -> io::Result<PathBuf> {
    let candidate = Path::new(path);

    if candidate.components().count() > 1 {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("module executable does not exist at {path}"),
        ));
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search) {
        let full = dir.join(candidate);
        if full.is_file() {
            return Ok(full);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("module executable does not exist at {path}"),
    ))
}

/// Module state visible to the admin surfaces.
struct ModuleDesc {
    exe: PathBuf,
    args: Vec<String>,
    /// Present while a supervision thread runs; dropping it asks the
    /// thread to stop without restart.
    disable: Option<Sender<()>>,
    /// Bumped on every launch so a stopping supervision thread cannot
    /// clear the handle of its successor.
    generation: u64,
}

/// Supervisor over all configured external modules.
pub struct Supervisor {
    name: String,
    factory: Arc<dyn ProcessFactory>,
    sink: LogBatcher,
    shutdown: Shutdown,
    waiter: crossbeam::sync::WaitGroup,
    modules: Arc<RwLock<HashMap<String, ModuleDesc>>>,
}

impl Supervisor {
    pub fn new(
        name: &str,
        factory: Arc<dyn ProcessFactory>,
        sink: LogBatcher,
        shutdown: Shutdown,
        waiter: crossbeam::sync::WaitGroup,
    ) -> Self {
        Self {
            name: name.to_string(),
            factory,
            sink,
            shutdown,
            waiter,
            modules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register and launch a module from its command line.
    pub fn start_module(&self, name: &str, command: &str) -> io::Result<()> {
        let mut parts = command.split_whitespace();
        let exe = parts.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty module command")
        })?;

        let exe = resolve_executable(exe)?;
        let args: Vec<String> = parts.map(String::from).collect();

        self.modules.write().insert(
            name.to_string(),
            ModuleDesc {
                exe: exe.clone(),
                args: args.clone(),
                disable: None,
                generation: 0,
            },
        );

        self.launch(name)
    }

    /// Launch (or relaunch after a disable) the supervision thread for a
    /// registered module.
    fn launch(&self, name: &str) -> io::Result<()> {
        let (exe, args, rx, generation) = {
            let mut modules = self.modules.write();
            let desc = modules.get_mut(name).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("unknown module {name}"))
            })?;

            if desc.disable.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "already enabled",
                ));
            }

            let (tx, rx) = bounded(0);
            desc.disable = Some(tx);
            desc.generation += 1;

            (desc.exe.clone(), desc.args.clone(), rx, desc.generation)
        };

        let loop_state = SuperviseLoop {
            supervisor_name: self.name.clone(),
            module_name: name.to_string(),
            generation,
            factory: self.factory.clone(),
            sink: self.sink.clone(),
            shutdown: self.shutdown.clone(),
            modules: self.modules.clone(),
            disable: rx,
            // Dropped when the loop exits, releasing the process to exit.
            _waiter: self.waiter.clone(),
        };

        std::thread::Builder::new()
            .name(format!("supervise-{name}"))
            .spawn(move || loop_state.run(&exe, &args))?;

        Ok(())
    }

    /// Snapshot of module states (name -> "enabled" / "disabled").
    pub fn list(&self) -> HashMap<String, String> {
        self.modules
            .read()
            .iter()
            .map(|(name, desc)| {
                let state = if desc.disable.is_some() {
                    "enabled"
                } else {
                    "disabled"
                };
                (name.clone(), state.to_string())
            })
            .collect()
    }

    /// Re-enable a disabled module. Errors: unknown name, already enabled.
    pub fn enable(&self, name: &str) -> Result<(), String> {
        if !self.modules.read().contains_key(name) {
            return Err("does not exist".to_string());
        }

        self.launch(name).map_err(|e| e.to_string())
    }

    /// Disable a running module: SIGTERM (SIGKILL after the grace period),
    /// no restart. Errors: unknown name, already disabled.
    pub fn disable(&self, name: &str) -> Result<(), String> {
        let mut modules = self.modules.write();

        let Some(desc) = modules.get_mut(name) else {
            return Err("does not exist".to_string());
        };

        match desc.disable.take() {
            // Dropping the sender signals the supervision thread.
            Some(_tx) => Ok(()),
            None => Err("already disabled".to_string()),
        }
    }
}

/// State owned by one module's supervision thread.
struct SuperviseLoop {
    supervisor_name: String,
    module_name: String,
    generation: u64,
    factory: Arc<dyn ProcessFactory>,
    sink: LogBatcher,
    shutdown: Shutdown,
    modules: Arc<RwLock<HashMap<String, ModuleDesc>>>,
    disable: Receiver<()>,
    _waiter: crossbeam::sync::WaitGroup,
}

impl SuperviseLoop {
    fn run(self, exe: &Path, args: &[String]) {
        loop {
            let mut child = match self.factory.spawn(exe, args) {
                Ok(child) => child,
                Err(e) => {
                    log::error!(
                        "[{}] starting {} module: {e}",
                        self.supervisor_name,
                        self.module_name
                    );
                    self.clear_handle();
                    return;
                }
            };

            log::info!(
                "[{}] starting {} module",
                self.supervisor_name,
                self.module_name
            );

            if let Some(stdout) = child.take_stdout() {
                self.scan(stdout, false);
            }
            if let Some(stderr) = child.take_stderr() {
                self.scan(stderr, true);
            }

            let signal = child.signal();

            let (wait_tx, wait_rx) = bounded(1);
            let waiter = std::thread::Builder::new()
                .name(format!("wait-{}", self.module_name))
                .spawn(move || {
                    let _ = wait_tx.send(child.wait());
                });

            if waiter.is_err() {
                log::error!(
                    "[{}] spawning waiter for {} module",
                    self.supervisor_name,
                    self.module_name
                );
                self.clear_handle();
                return;
            }

            crossbeam::select! {
                recv(wait_rx) -> result => {
                    let code = match result {
                        Ok(Ok(code)) => code,
                        Ok(Err(e)) => {
                            log::error!(
                                "[{}] waiting on {} module: {e}",
                                self.supervisor_name,
                                self.module_name
                            );
                            1
                        }
                        Err(_) => 1,
                    };

                    if code == EXIT_NO_RESTART {
                        log::error!(
                            "[{}] {} module exited with code {code}... not restarting",
                            self.supervisor_name,
                            self.module_name
                        );
                        self.clear_handle();
                        return;
                    }

                    log::error!(
                        "[{}] {} module died (exit code {code})... restarting",
                        self.supervisor_name,
                        self.module_name
                    );
                    continue;
                }
                recv(self.shutdown.channel()) -> _ => {
                    log::info!(
                        "[{}] stopping {} module",
                        self.supervisor_name,
                        self.module_name
                    );
                    self.stop_child(&*signal, &wait_rx);
                    return;
                }
                recv(self.disable) -> _ => {
                    log::info!(
                        "[{}] disabling {} module",
                        self.supervisor_name,
                        self.module_name
                    );
                    self.stop_child(&*signal, &wait_rx);
                    self.clear_handle();
                    return;
                }
            }
        }
    }

    /// SIGTERM, wait out the grace period, SIGKILL if still alive.
    fn stop_child(&self, signal: &dyn ProcessSignal, wait_rx: &Receiver<io::Result<i32>>) {
        signal.terminate();

        match wait_rx.recv_timeout(TERM_GRACE) {
            Ok(_) => {
                log::info!(
                    "[{}] {} module has stopped",
                    self.supervisor_name,
                    self.module_name
                );
            }
            Err(_) => {
                log::warn!(
                    "[{}] forcefully killing {} module",
                    self.supervisor_name,
                    self.module_name
                );
                signal.kill();
                let _ = wait_rx.recv_timeout(Duration::from_secs(2));
            }
        }
    }

    fn clear_handle(&self) {
        if let Some(desc) = self.modules.write().get_mut(&self.module_name) {
            if desc.generation == self.generation {
                desc.disable = None;
            }
        }
    }

    /// Forward one output stream line-by-line to the local log and the
    /// external sink batcher.
    fn scan(&self, stream: Box<dyn Read + Send>, error_stream: bool) {
        let module = self.module_name.clone();
        let sink = self.sink.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("scan-{module}"))
            .spawn(move || {
                let reader = BufReader::new(stream);

                for line in reader.lines() {
                    let Ok(line) = line else { return };

                    if error_stream {
                        log::error!("[LOG] {line}");
                    } else {
                        log::info!("[LOG] {line}");
                    }

                    sink.forward(LogLine::new(&module, line, error_stream));
                }
            });

        if let Err(e) = spawned {
            log::error!("[{}] spawning output scanner: {e}", self.supervisor_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// A scripted process: emits fixed lines, then exits with the next
    /// code from the script (blocking on a signal when the script says so).
    struct ScriptedFactory {
        codes: Mutex<Vec<i32>>,
        spawns: Arc<Mutex<usize>>,
    }

    struct ScriptedSignal {
        terminated: Sender<()>,
    }

    impl ProcessSignal for ScriptedSignal {
        fn terminate(&self) {
            let _ = self.terminated.send(());
        }

        fn kill(&self) {
            let _ = self.terminated.send(());
        }
    }

    struct ScriptedProcess {
        code: Option<i32>,
        terminated_tx: Sender<()>,
        terminated_rx: Receiver<()>,
    }

    impl ProcessHandle for ScriptedProcess {
        fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
            Some(Box::new(std::io::Cursor::new(b"booting\n".to_vec())))
        }

        fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
            None
        }

        fn signal(&self) -> Arc<dyn ProcessSignal> {
            Arc::new(ScriptedSignal {
                terminated: self.terminated_tx.clone(),
            })
        }

        fn wait(self: Box<Self>) -> io::Result<i32> {
            match self.code {
                Some(code) => Ok(code),
                // Script exhausted: stay "running" until signaled.
                None => {
                    let _ = self.terminated_rx.recv();
                    Ok(0)
                }
            }
        }
    }

    impl ProcessFactory for ScriptedFactory {
        fn spawn(&self, _: &Path, _: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
            *self.spawns.lock() += 1;

            let mut codes = self.codes.lock();
            let code = if codes.is_empty() {
                None
            } else {
                Some(codes.remove(0))
            };

            let (tx, rx) = bounded(1);
            Ok(Box::new(ScriptedProcess {
                code,
                terminated_tx: tx,
                terminated_rx: rx,
            }))
        }
    }

    fn supervisor_with(
        codes: Vec<i32>,
    ) -> (Supervisor, Arc<Mutex<usize>>, Shutdown) {
        let spawns: Arc<Mutex<usize>> = Arc::default();
        let shutdown = Shutdown::new();

        let factory = Arc::new(ScriptedFactory {
            codes: Mutex::new(codes),
            spawns: spawns.clone(),
        });

        let supervisor = Supervisor::new(
            "CPU",
            factory,
            LogBatcher::disabled(),
            shutdown.clone(),
            crossbeam::sync::WaitGroup::new(),
        );

        (supervisor, spawns, shutdown)
    }

    fn wait_for_spawns(spawns: &Arc<Mutex<usize>>, want: usize) {
        for _ in 0..100 {
            if *spawns.lock() >= want {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("never reached {want} spawns (got {})", *spawns.lock());
    }

    #[test]
    fn restarts_on_nonzero_exit_until_no_restart_code() {
        // Three crashes with code 2, then the no-restart code.
        let (supervisor, spawns, shutdown) =
            supervisor_with(vec![2, 2, 2, EXIT_NO_RESTART]);

        // The exe path is never executed by the scripted factory.
        supervisor.modules.write().insert(
            "flaky".to_string(),
            ModuleDesc {
                exe: PathBuf::from("/bin/true"),
                args: Vec::new(),
                disable: None,
                generation: 0,
            },
        );
        supervisor.launch("flaky").unwrap();

        wait_for_spawns(&spawns, 4);

        // Give the loop time to (incorrectly) relaunch a fifth time.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*spawns.lock(), 4);

        // The crashed module shows as disabled.
        assert_eq!(supervisor.list()["flaky"], "disabled");

        shutdown.trip();
    }

    #[test]
    fn disable_stops_without_restart_and_enable_relaunches() {
        let (supervisor, spawns, shutdown) = supervisor_with(vec![]);

        supervisor.modules.write().insert(
            "steady".to_string(),
            ModuleDesc {
                exe: PathBuf::from("/bin/true"),
                args: Vec::new(),
                disable: None,
                generation: 0,
            },
        );
        supervisor.launch("steady").unwrap();
        wait_for_spawns(&spawns, 1);
        assert_eq!(supervisor.list()["steady"], "enabled");

        supervisor.disable("steady").unwrap();

        for _ in 0..100 {
            if supervisor.list()["steady"] == "disabled" {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(supervisor.list()["steady"], "disabled");
        assert_eq!(supervisor.disable("steady"), Err("already disabled".to_string()));

        supervisor.enable("steady").unwrap();
        wait_for_spawns(&spawns, 2);
        assert_eq!(supervisor.list()["steady"], "enabled");

        assert_eq!(
            supervisor.enable("missing"),
            Err("does not exist".to_string())
        );

        shutdown.trip();
    }

    #[test]
    fn resolve_rejects_missing_paths() {
        assert!(resolve_executable("/definitely/not/here").is_err());
        assert!(resolve_executable("sh").is_ok());
    }
}
