// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Supervisor restart policy against real child processes: every non-zero
//! exit relaunches exactly once, exit code 101 stops the relaunch loop.

use otsim::cpu::sinks::LogBatcher;
use otsim::cpu::supervisor::{OsProcessFactory, Supervisor};
use otsim::util::Shutdown;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Write a shell script that exits 2 on its first three runs and 101 from
/// the fourth run on, counting runs in a side file.
fn crash_script(dir: &std::path::Path) -> std::path::PathBuf {
    let counter = dir.join("count");
    let path = dir.join("crashy.sh");

    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "n=$(cat {0} 2>/dev/null || echo 0)", counter.display()).unwrap();
    writeln!(file, "n=$((n+1))").unwrap();
    writeln!(file, "echo $n > {0}", counter.display()).unwrap();
    writeln!(file, "echo run $n").unwrap();
    writeln!(file, "if [ $n -ge 4 ]; then exit 101; fi").unwrap();
    writeln!(file, "exit 2").unwrap();
    drop(file);

    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    path
}

fn read_count(dir: &std::path::Path) -> u32 {
    std::fs::read_to_string(dir.join("count"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[test]
fn restarts_until_no_restart_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = crash_script(dir.path());

    let shutdown = Shutdown::new();
    let supervisor = Supervisor::new(
        "CPU",
        Arc::new(OsProcessFactory),
        LogBatcher::disabled(),
        shutdown.clone(),
        crossbeam::sync::WaitGroup::new(),
    );

    supervisor
        .start_module("crashy", script.to_str().unwrap())
        .unwrap();

    // S5: three exits with code 2 are each relaunched; the fourth run
    // exits 101 and is not.
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if read_count(dir.path()) >= 4 {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(read_count(dir.path()), 4, "exactly four launches");

    // No fifth launch after the no-restart exit.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(read_count(dir.path()), 4);

    // The crashed module reads as disabled.
    assert_eq!(supervisor.list()["crashy"], "disabled");

    shutdown.trip();
}

#[test]
fn sigterm_stops_long_running_child() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sleepy.sh");

    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "trap 'exit 0' TERM").unwrap();
    writeln!(file, "while true; do sleep 0.1; done").unwrap();
    drop(file);

    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let shutdown = Shutdown::new();
    let supervisor = Supervisor::new(
        "CPU",
        Arc::new(OsProcessFactory),
        LogBatcher::disabled(),
        shutdown.clone(),
        crossbeam::sync::WaitGroup::new(),
    );

    supervisor
        .start_module("sleepy", path.to_str().unwrap())
        .unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(supervisor.list()["sleepy"], "enabled");

    // Disable delivers SIGTERM; the trap exits cleanly and the module is
    // not relaunched.
    supervisor.disable("sleepy").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if supervisor.list()["sleepy"] == "disabled" {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(supervisor.list()["sleepy"], "disabled");

    shutdown.trip();
}
