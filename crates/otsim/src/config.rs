// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XML configuration loading.
//!
//! The config document's root element is `ot-sim`. A `message-bus` child
//! supplies the bus endpoints; every other child element whose tag matches a
//! registered factory becomes a module. Tags without a registered factory
//! are skipped, which is how one config file drives several single-purpose
//! module binaries.
//!
//! `{{config_file}}` in any text value is interpolated with the active
//! config path before parsing.

use crate::error::ConfigError;
use crate::runtime::{Module, ModuleRegistry};
use crate::util::interpolate_config_path;
use std::path::Path;

/// Default bus endpoints when `message-bus` is absent.
pub const DEFAULT_PUB_ENDPOINT: &str = "tcp://127.0.0.1:5678";
pub const DEFAULT_PULL_ENDPOINT: &str = "tcp://127.0.0.1:1234";

pub struct Config {
    pub pub_endpoint: String,
    pub pull_endpoint: String,
    pub modules: Vec<Box<dyn Module>>,
}

impl Config {
    /// Parse the config file, instantiating and configuring every module
    /// with a registered factory, in document order.
    pub fn parse(path: &Path, registry: &ModuleRegistry) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let text = interpolate_config_path(&text, path.to_str().unwrap_or_default());

        let doc = roxmltree::Document::parse(&text)?;
        let root = doc.root_element();

        if root.tag_name().name() != "ot-sim" {
            return Err(ConfigError::MissingRoot);
        }

        let mut config = Self {
            pub_endpoint: DEFAULT_PUB_ENDPOINT.to_string(),
            pull_endpoint: DEFAULT_PULL_ENDPOINT.to_string(),
            modules: Vec::new(),
        };

        if let Some(bus) = xml::child(root, "message-bus") {
            if let Some(endpoint) = xml::child_text(bus, "pub-endpoint") {
                config.pub_endpoint = endpoint.to_string();
            }
            if let Some(endpoint) = xml::child_text(bus, "pull-endpoint") {
                config.pull_endpoint = endpoint.to_string();
            }
        }

        for child in root.children().filter(|n| n.is_element()) {
            let tag = child.tag_name().name();

            if tag == "message-bus" {
                continue;
            }

            let Some(factory) = registry.get(tag) else {
                continue;
            };

            let mut module = factory.new_module(child)?;
            module.configure(child)?;
            config.modules.push(module);
        }

        Ok(config)
    }
}

/// roxmltree traversal helpers shared by module `configure` methods.
pub mod xml {
    use super::ConfigError;

    pub type Node<'a, 'input> = roxmltree::Node<'a, 'input>;

    /// First child element named `tag`.
    pub fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
        node.children()
            .find(|n| n.is_element() && n.tag_name().name() == tag)
    }

    /// Trimmed text of the first child element named `tag`.
    pub fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
        child(node, tag).and_then(|n| n.text()).map(str::trim)
    }

    /// All child elements, in document order.
    pub fn children<'a, 'input>(
        node: Node<'a, 'input>,
    ) -> impl Iterator<Item = Node<'a, 'input>> {
        node.children().filter(|n| n.is_element())
    }

    /// Trimmed element text ("" when empty).
    pub fn text<'a>(node: Node<'a, '_>) -> &'a str {
        node.text().map(str::trim).unwrap_or_default()
    }

    /// Attribute value with a fallback, mirroring how module names default
    /// to their tag.
    pub fn attr_or<'a>(node: Node<'a, '_>, name: &str, fallback: &'a str) -> &'a str {
        node.attribute(name).unwrap_or(fallback)
    }

    /// Parse the text of child element `tag` as `T`, if present.
    pub fn parse_child<T: std::str::FromStr>(
        node: Node,
        module: &str,
        tag: &str,
    ) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match child_text(node, tag) {
            Some(text) => text.parse::<T>().map(Some).map_err(|e| {
                ConfigError::invalid(&format!("{module}/{tag}"), text, e.to_string())
            }),
            None => Ok(None),
        }
    }

    /// Parse the text of child element `tag` as a duration, if present.
    pub fn parse_child_duration(
        node: Node,
        module: &str,
        tag: &str,
    ) -> Result<Option<std::time::Duration>, ConfigError> {
        match child_text(node, tag) {
            Some(text) => crate::util::parse_duration(text)
                .map(Some)
                .map_err(|e| ConfigError::invalid(&format!("{module}/{tag}"), text, e)),
            None => Ok(None),
        }
    }
}
