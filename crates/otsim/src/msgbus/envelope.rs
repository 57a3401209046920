// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Versioned, kind-tagged message wrapper exchanged on the bus.
//!
//! An envelope is immutable once constructed. The payload is carried as raw
//! JSON and parsed lazily through the typed accessors, so a subscriber only
//! pays for the kinds it handles. Payload structs default every field, which
//! keeps decoding forward-compatible with additive fields from newer minor
//! versions.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::util::epoch_secs;

/// Envelope schema version emitted by this process.
pub const ENVELOPE_VERSION: &str = "v1";

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Status,
    Update,
    Metric,
    HealthCheck,
    ModuleControl,
    Confirmation,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Status => "Status",
            Kind::Update => "Update",
            Kind::Metric => "Metric",
            Kind::HealthCheck => "HealthCheck",
            Kind::ModuleControl => "ModuleControl",
            Kind::Confirmation => "Confirmation",
        };
        f.write_str(name)
    }
}

/// Errors produced by envelope encoding/decoding and typed access.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("decoding envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("not a {expected} message (found {actual})")]
    KindMismatch { expected: Kind, actual: Kind },
}

impl EnvelopeError {
    /// True when a typed accessor was invoked against the wrong kind.
    /// Handlers swallow this case silently.
    pub fn is_kind_mismatch(&self) -> bool {
        matches!(self, EnvelopeError::KindMismatch { .. })
    }
}

/// A (tag, value, timestamp) triple; the bus's unit of telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub tag: String,
    pub value: f64,
    #[serde(rename = "ts", default)]
    pub tstamp: u64,
}

impl Point {
    /// A point stamped with the current epoch second.
    pub fn new(tag: impl Into<String>, value: f64) -> Self {
        Self {
            tag: tag.into(),
            value,
            tstamp: epoch_secs(),
        }
    }
}

/// Payload contract: every kind-specific record knows its own discriminator.
pub trait Payload: Serialize + DeserializeOwned {
    const KIND: Kind;
}

/// Authoritative current values from a producer. Consumers overwrite their
/// local view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub measurements: Vec<Point>,
}

impl Payload for Status {
    const KIND: Kind = Kind::Status;
}

/// Requested mutation. `recipient` and `confirm` are only populated by the
/// module-control flow; telemetry updates leave them empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub updates: Vec<Point>,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub confirm: String,
}

impl Payload for Update {
    const KIND: Kind = Kind::Update;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    #[default]
    Counter,
    Gauge,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub kind: MetricKind,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

impl Payload for Metrics {
    const KIND: Kind = Kind::Metric;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub state: String,
}

impl Payload for HealthCheck {
    const KIND: Kind = Kind::HealthCheck;
}

/// List/enable/disable request addressed to a supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleControl {
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub confirm: String,
}

impl Payload for ModuleControl {
    const KIND: Kind = Kind::ModuleControl;
}

/// Reply to a ModuleControl request, correlated by `confirm`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(default)]
    pub confirm: String,
    #[serde(default)]
    pub results: BTreeMap<String, String>,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

impl Payload for Confirmation {
    const KIND: Kind = Kind::Confirmation;
}

/// The wire wrapper: version, kind discriminator, sender metadata, and the
/// kind-specific payload as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub kind: Kind,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    contents: Box<RawValue>,
}

impl Envelope {
    /// Construct an envelope for any payload kind, setting version, kind,
    /// and sender in one step.
    pub fn new<P: Payload>(sender: &str, payload: &P) -> Result<Self, EnvelopeError> {
        let contents = serde_json::value::to_raw_value(payload)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("sender".to_string(), sender.to_string());

        Ok(Self {
            version: ENVELOPE_VERSION.to_string(),
            kind: P::KIND,
            metadata,
            contents,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The `sender` metadata value, or "" when absent.
    pub fn sender(&self) -> &str {
        self.metadata.get("sender").map(String::as_str).unwrap_or("")
    }

    /// Parse the payload as `P`, failing with `KindMismatch` when the
    /// envelope carries a different kind.
    pub fn contents<P: Payload>(&self) -> Result<P, EnvelopeError> {
        if self.kind != P::KIND {
            return Err(EnvelopeError::KindMismatch {
                expected: P::KIND,
                actual: self.kind,
            });
        }

        Ok(serde_json::from_str(self.contents.get())?)
    }

    pub fn status(&self) -> Result<Status, EnvelopeError> {
        self.contents()
    }

    pub fn update(&self) -> Result<Update, EnvelopeError> {
        self.contents()
    }

    pub fn metrics(&self) -> Result<Metrics, EnvelopeError> {
        self.contents()
    }

    pub fn health_check(&self) -> Result<HealthCheck, EnvelopeError> {
        self.contents()
    }

    pub fn module_control(&self) -> Result<ModuleControl, EnvelopeError> {
        self.contents()
    }

    pub fn confirmation(&self) -> Result<Confirmation, EnvelopeError> {
        self.contents()
    }
}
