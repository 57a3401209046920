// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded SunSpec model schemas.
//!
//! Each model is a JSON resource keyed by id, listing ordered points with a
//! name, type, size in words, and an optional scale factor. The scale
//! factor is either a fixed exponent or the name of a sibling `sunssf`
//! point. The first two points of every model are the well-known `ID` and
//! `L` header words; they are not part of the data region.

use super::register::{SsRegister, SunSpecError, SunSpecType};
use serde::Deserialize;
use thiserror::Error;

/// SunSpec identifier ("SunS" as a big-endian uint32) at register 40000.
pub const SUNSPEC_IDENTIFIER: u32 = 0x5375_6E53;

/// Holding-register base address of the SunSpec map.
pub const SUNSPEC_BASE_ADDR: u16 = 40000;

/// Model id marking the end of the model chain.
pub const END_MODEL_ID: u16 = 65535;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("no embedded schema for model {0}")]
    UnknownModel(u16),

    #[error("parsing model {id} schema: {source}")]
    Parse {
        id: u16,
        source: serde_json::Error,
    },

    #[error("model {id} point {point}: {source}")]
    Point {
        id: u16,
        point: String,
        source: SunSpecError,
    },
}

/// Scale factor reference: a fixed exponent or the name of the sibling
/// point carrying it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SfRef {
    Fixed(i32),
    Point(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u16,
    #[serde(default)]
    pub sf: Option<SfRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Group {
    pub name: String,
    pub points: Vec<PointDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Schema {
    pub id: u16,
    pub group: Group,
}

/// Embedded model schemas, ordered by id.
const EMBEDDED: &[(u16, &str)] = &[
    (1, include_str!("models/model_1.json")),
    (101, include_str!("models/model_101.json")),
    (103, include_str!("models/model_103.json")),
];

/// Look up the embedded schema for a model id.
pub fn model_schema(id: u16) -> Result<Schema, SchemaError> {
    let raw = EMBEDDED
        .iter()
        .find(|(model_id, _)| *model_id == id)
        .map(|(_, raw)| *raw)
        .ok_or(SchemaError::UnknownModel(id))?;

    serde_json::from_str(raw).map_err(|source| SchemaError::Parse { id, source })
}

/// Word count of the model's data region: every point after the ID and L
/// header words.
pub fn model_length(schema: &Schema) -> u16 {
    schema
        .group
        .points
        .iter()
        .skip(2)
        .map(|point| point.size)
        .sum()
}

/// Build the ordered data-region registers for a model, resolving types and
/// scale-factor references from the schema.
pub fn model_registers(schema: &Schema) -> Result<Vec<SsRegister>, SchemaError> {
    let mut registers = Vec::with_capacity(schema.group.points.len().saturating_sub(2));

    for point in schema.group.points.iter().skip(2) {
        let dtype = SunSpecType::parse(&point.kind).map_err(|source| SchemaError::Point {
            id: schema.id,
            point: point.name.clone(),
            source,
        })?;

        let mut reg = SsRegister::new(&point.name, dtype);

        match &point.sf {
            Some(SfRef::Fixed(exp)) => reg.scaling = *exp,
            Some(SfRef::Point(name)) => reg.scale_register = Some(name.clone()),
            None => {}
        }

        registers.push(reg);
    }

    Ok(registers)
}
