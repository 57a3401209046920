// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared MQTT configuration types: broker endpoints (with optional TLS
//! material) and the publication payload template.

use crate::error::ConfigError;
use chrono::Utc;

/// A remote broker endpoint. `url` is `scheme://host:port` with scheme
/// `tcp`, `ssl`, or `tls`; the secure schemes require certificate and key
/// paths.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub url: String,

    pub ca_path: Option<String>,
    pub key_path: Option<String>,
    pub cert_path: Option<String>,
    pub insecure: bool,

    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let (scheme, rest) = self.url.split_once("://").ok_or_else(|| {
            ConfigError::invalid(
                "mqtt/endpoint",
                &self.url,
                "endpoint URL is missing a scheme (must be tcp, ssl, or tls)",
            )
        })?;

        if !matches!(scheme, "tcp" | "ssl" | "tls") {
            return Err(ConfigError::invalid(
                "mqtt/endpoint",
                &self.url,
                "scheme must be tcp, ssl, or tls",
            ));
        }

        let (host, port) = rest.split_once(':').ok_or_else(|| {
            ConfigError::invalid("mqtt/endpoint", &self.url, "missing port")
        })?;

        self.scheme = scheme.to_string();
        self.host = host.to_string();
        self.port = port
            .parse()
            .map_err(|_| ConfigError::invalid("mqtt/endpoint", &self.url, "invalid port"))?;

        if self.secure() && (self.cert_path.is_none() || self.key_path.is_none()) {
            return Err(ConfigError::Other(
                "must provide 'certificate' and 'key' for MQTT module config when using ssl/tls"
                    .into(),
            ));
        }

        Ok(())
    }

    pub fn secure(&self) -> bool {
        matches!(self.scheme.as_str(), "ssl" | "tls")
    }
}

/// Publication payload data, rendered through the configured template.
#[derive(Debug, Clone)]
pub struct PayloadData {
    pub epoch: i64,
    pub timestamp: String,
    pub client: String,
    pub topic: String,
    pub value: f64,
}

impl PayloadData {
    pub fn new(client: &str, topic: &str, value: f64, timestamp_format: Option<&str>) -> Self {
        let now = Utc::now();

        let timestamp = match timestamp_format {
            Some(format) => now.format(format).to_string(),
            None => now.to_rfc3339(),
        };

        Self {
            epoch: now.timestamp(),
            timestamp,
            client: client.to_string(),
            topic: topic.to_string(),
            value,
        }
    }

    /// Render the payload template. Variables use the `{{ .Name }}` form:
    /// `Epoch`, `Timestamp`, `Client`, `Topic`, and `Value`.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            rest = &rest[open + 2..];

            let Some(close) = rest.find("}}") else {
                out.push_str("{{");
                break;
            };

            let name = rest[..close].trim().trim_start_matches('.');
            rest = &rest[close + 2..];

            match name {
                "Epoch" => out.push_str(&self.epoch.to_string()),
                "Timestamp" => out.push_str(&self.timestamp),
                "Client" => out.push_str(&self.client),
                "Topic" => out.push_str(&self.topic),
                "Value" => out.push_str(&format_value(self.value)),
                other => {
                    log::warn!("[mqtt] unknown payload template variable '{other}'");
                }
            }
        }

        out.push_str(rest);
        out
    }
}

/// Default payload template: the bare value.
pub const DEFAULT_PAYLOAD_TEMPLATE: &str = "{{ .Value }}";

fn format_value(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_tcp() {
        let mut endpoint = Endpoint {
            url: "tcp://broker.example.com:1883".into(),
            ..Default::default()
        };
        endpoint.validate().unwrap();

        assert_eq!(endpoint.scheme, "tcp");
        assert_eq!(endpoint.host, "broker.example.com");
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.secure());
    }

    #[test]
    fn secure_endpoint_requires_material() {
        let mut endpoint = Endpoint {
            url: "ssl://broker.example.com:8883".into(),
            ..Default::default()
        };
        assert!(endpoint.validate().is_err());

        endpoint.cert_path = Some("/etc/otsim/client.crt".into());
        endpoint.key_path = Some("/etc/otsim/client.key".into());
        endpoint.validate().unwrap();
        assert!(endpoint.secure());
    }

    #[test]
    fn missing_scheme_rejected() {
        let mut endpoint = Endpoint {
            url: "broker.example.com:1883".into(),
            ..Default::default()
        };
        assert!(endpoint.validate().is_err());
    }

    #[test]
    fn template_renders_all_variables() {
        let data = PayloadData {
            epoch: 1700000000,
            timestamp: "2023-11-14T22:13:20Z".into(),
            client: "ot-sim-device-1".into(),
            topic: "bus/voltage".into(),
            value: 120.5,
        };

        let out = data.render(
            r#"{"ts": {{ .Epoch }}, "at": "{{ .Timestamp }}", "from": "{{ .Client }}", "{{ .Topic }}": {{ .Value }}}"#,
        );

        assert_eq!(
            out,
            r#"{"ts": 1700000000, "at": "2023-11-14T22:13:20Z", "from": "ot-sim-device-1", "bus/voltage": 120.5}"#
        );
    }

    #[test]
    fn default_template_is_bare_value() {
        let data = PayloadData {
            epoch: 0,
            timestamp: String::new(),
            client: String::new(),
            topic: String::new(),
            value: 3.0,
        };

        assert_eq!(data.render(DEFAULT_PAYLOAD_TEMPLATE), "3");
    }
}
