// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Administration CLI for a running simulator.
//!
//! Talks to the CPU module's REST surface:
//!
//! ```bash
//! otsimctl query
//! otsimctl query sw.breaker
//! otsimctl write load 3.5
//! otsimctl modules list
//! otsimctl modules disable logic
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use std::collections::BTreeMap;
use tabled::{settings::Style, Table, Tabled};

/// OT-sim administration CLI
#[derive(Parser, Debug)]
#[command(name = "otsimctl")]
#[command(about = "OT-sim administration CLI")]
#[command(version)]
struct Args {
    /// CPU API address
    #[arg(short, long, default_value = "http://127.0.0.1:9101")]
    api: String,

    /// Raw JSON output
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query tag values (all tags, or specific ones)
    Query {
        /// Tags to query; all when empty
        tags: Vec<String>,
    },

    /// Write a tag value
    Write {
        tag: String,
        value: f64,
    },

    /// Module operations
    Modules {
        #[command(subcommand)]
        command: ModulesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ModulesCommand {
    /// List modules and their states
    List,
    /// Enable a disabled module
    Enable { name: String },
    /// Disable a running module
    Disable { name: String },
}

#[derive(Debug, Deserialize)]
struct PointRow {
    tag: String,
    value: f64,
    #[serde(default)]
    ts: u64,
}

#[derive(Tabled)]
struct TagRow {
    #[tabled(rename = "Tag")]
    tag: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

#[derive(Tabled)]
struct ModuleRow {
    #[tabled(rename = "Module")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
}

fn main() {
    let args = Args::parse();

    let result = match &args.command {
        Command::Query { tags } => query(&args, tags),
        Command::Write { tag, value } => write(&args, tag, *value),
        Command::Modules { command } => modules(&args, command),
    };

    if let Err(e) = result {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::new()
}

fn format_ts(ts: u64) -> String {
    if ts == 0 {
        return "-".to_string();
    }

    chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn query(args: &Args, tags: &[String]) -> Result<(), String> {
    let mut points: Vec<PointRow> = Vec::new();

    if tags.is_empty() {
        #[derive(Deserialize)]
        struct QueryResponse {
            #[serde(default)]
            points: Vec<PointRow>,
        }

        let resp: QueryResponse = client()
            .get(format!("{}/api/v1/query", args.api))
            .send()
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json()
            .map_err(|e| e.to_string())?;

        points = resp.points;
        points.sort_by(|a, b| a.tag.cmp(&b.tag));
    } else {
        for tag in tags {
            let point: PointRow = client()
                .get(format!("{}/api/v1/query/{tag}", args.api))
                .send()
                .map_err(|e| e.to_string())?
                .error_for_status()
                .map_err(|_| format!("tag {tag} is unknown"))?
                .json()
                .map_err(|e| e.to_string())?;

            points.push(point);
        }
    }

    if args.json {
        let out: Vec<_> = points
            .iter()
            .map(|p| serde_json::json!({"tag": p.tag, "value": p.value, "ts": p.ts}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
        return Ok(());
    }

    let rows: Vec<TagRow> = points
        .into_iter()
        .map(|p| TagRow {
            tag: p.tag,
            value: format!("{:.6}", p.value),
            updated: format_ts(p.ts),
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

fn write(args: &Args, tag: &str, value: f64) -> Result<(), String> {
    client()
        .post(format!("{}/api/v1/write/{tag}/{value}", args.api))
        .send()
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;

    println!("{} {tag} = {value}", "wrote".green());
    Ok(())
}

fn modules(args: &Args, command: &ModulesCommand) -> Result<(), String> {
    #[derive(Deserialize)]
    struct ModulesResponse {
        #[serde(default)]
        modules: BTreeMap<String, String>,
    }

    let request = match command {
        ModulesCommand::List => client().get(format!("{}/api/v1/modules", args.api)),
        ModulesCommand::Enable { name } => {
            client().post(format!("{}/api/v1/modules/{name}", args.api))
        }
        ModulesCommand::Disable { name } => {
            client().delete(format!("{}/api/v1/modules/{name}", args.api))
        }
    };

    let resp = request.send().map_err(|e| e.to_string())?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        return Err(format!("{status}: {body}"));
    }

    let resp: ModulesResponse = resp.json().map_err(|e| e.to_string())?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&resp.modules).unwrap_or_default()
        );
        return Ok(());
    }

    let rows: Vec<ModuleRow> = resp
        .modules
        .into_iter()
        .map(|(name, state)| ModuleRow {
            state: if state == "enabled" {
                state.green().to_string()
            } else {
                state.yellow().to_string()
            },
            name,
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}
