// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed publish/subscribe message bus.
//!
//! Telemetry flows as kind-tagged [`Envelope`]s over two endpoints: modules
//! push to the aggregator's pull endpoint, the aggregator fans every frame
//! out on the publish endpoint, and subscribers filter on topic.

mod broker;
mod envelope;
mod metrics;
mod pusher;
mod subscriber;

pub use broker::Broker;
pub use envelope::{
    Confirmation, Envelope, EnvelopeError, HealthCheck, Kind, Metric, MetricKind, Metrics,
    ModuleControl, Payload, Point, Status, Update, ENVELOPE_VERSION,
};
pub use metrics::MetricsPusher;
pub use pusher::{PushError, Pusher};
pub use subscriber::{Subscriber, SubscriberHandle};

/// Status / Update / Confirmation telemetry.
pub const RUNTIME_TOPIC: &str = "RUNTIME";

/// Metric / HealthCheck envelopes.
pub const HEALTH_TOPIC: &str = "HEALTH";

/// Free-form log lines.
pub const LOG_TOPIC: &str = "LOG";

/// ModuleControl / Confirmation envelopes for the supervisor.
pub const INTERNAL_TOPIC: &str = "INTERNAL";
