// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SunSpec point register.
//!
//! SunSpec extends the plain Modbus data types with accumulators, bitfields,
//! enums, the `sunssf` scale-factor type, padding, and fixed-size strings.
//! Scale factors resolve at access time: a point's exponent comes either
//! from a static value or from a sibling `sunssf` point, so conversion
//! methods take the resolved exponent as an argument.
//!
//! Sign convention: `engineering = wire * 10^sf`, so encoding divides by
//! `10^sf`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SunSpecError {
    #[error("unknown data type {0}")]
    UnknownDataType(String),

    #[error("not a value register")]
    NotAValue,

    #[error("not a string register")]
    NotAString,

    #[error("short frame for point {name}: got {got} bytes, want {want}")]
    ShortFrame {
        name: String,
        got: usize,
        want: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SunSpecType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Acc16,
    Acc32,
    Acc64,
    Bitfield16,
    Bitfield32,
    Enum16,
    Enum32,
    Float32,
    Sunssf,
    Pad,
    String8,
    String16,
}

impl SunSpecType {
    pub fn parse(s: &str) -> Result<Self, SunSpecError> {
        match s {
            "int16" => Ok(SunSpecType::Int16),
            "uint16" => Ok(SunSpecType::Uint16),
            "int32" => Ok(SunSpecType::Int32),
            "uint32" => Ok(SunSpecType::Uint32),
            "acc16" => Ok(SunSpecType::Acc16),
            "acc32" => Ok(SunSpecType::Acc32),
            "acc64" => Ok(SunSpecType::Acc64),
            "bitfield16" => Ok(SunSpecType::Bitfield16),
            "bitfield32" => Ok(SunSpecType::Bitfield32),
            "enum16" => Ok(SunSpecType::Enum16),
            "enum32" => Ok(SunSpecType::Enum32),
            "float32" => Ok(SunSpecType::Float32),
            "sunssf" => Ok(SunSpecType::Sunssf),
            "pad" => Ok(SunSpecType::Pad),
            "string8" => Ok(SunSpecType::String8),
            "string16" => Ok(SunSpecType::String16),
            other => Err(SunSpecError::UnknownDataType(other.to_string())),
        }
    }

    /// Word count (16-bit registers) occupied by this data type.
    pub fn count(&self) -> u16 {
        match self {
            SunSpecType::Int16
            | SunSpecType::Uint16
            | SunSpecType::Acc16
            | SunSpecType::Bitfield16
            | SunSpecType::Enum16
            | SunSpecType::Sunssf
            | SunSpecType::Pad => 1,
            SunSpecType::Int32
            | SunSpecType::Uint32
            | SunSpecType::Acc32
            | SunSpecType::Bitfield32
            | SunSpecType::Enum32
            | SunSpecType::Float32 => 2,
            SunSpecType::Acc64 => 4,
            SunSpecType::String8 => 8,
            SunSpecType::String16 => 16,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, SunSpecType::String8 | SunSpecType::String16)
    }

    /// Scale-factor and padding points carry no telemetry of their own.
    pub fn is_meta(&self) -> bool {
        matches!(self, SunSpecType::Sunssf | SunSpecType::Pad)
    }

    fn scales(&self) -> bool {
        matches!(
            self,
            SunSpecType::Int16
                | SunSpecType::Uint16
                | SunSpecType::Int32
                | SunSpecType::Uint32
                | SunSpecType::Acc16
                | SunSpecType::Acc32
                | SunSpecType::Acc64
        )
    }
}

/// One point of a SunSpec model, bound to raw wire words and optionally to
/// a bus tag.
#[derive(Debug, Clone)]
pub struct SsRegister {
    pub name: String,
    pub dtype: SunSpecType,
    pub count: u16,

    /// Static scale exponent, used when `scale_register` is unset.
    pub scaling: i32,
    /// Name of the sibling `sunssf` point supplying the runtime exponent.
    pub scale_register: Option<String>,

    /// Bus tag driving this point, when configured.
    pub tag: Option<String>,

    pub internal_value: f64,
    pub internal_string: String,

    /// Raw wire words retained during model parsing, so scale factors can
    /// be resolved after the whole model has been read.
    pub raw: Vec<u8>,
}

impl SsRegister {
    pub fn new(name: &str, dtype: SunSpecType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            count: dtype.count(),
            scaling: 0,
            scale_register: None,
            tag: None,
            internal_value: 0.0,
            internal_string: String::new(),
            raw: Vec::new(),
        }
    }

    /// Encode `value` (engineering units) into wire words using the
    /// resolved scale exponent.
    pub fn bytes(&self, value: f64, scale: i32) -> Result<Vec<u8>, SunSpecError> {
        let descale = 10f64.powi(-scale);

        let buf = match self.dtype {
            SunSpecType::Acc16 | SunSpecType::Uint16 => {
                ((value * descale) as u16).to_be_bytes().to_vec()
            }
            SunSpecType::Acc32 | SunSpecType::Uint32 => {
                ((value * descale) as u32).to_be_bytes().to_vec()
            }
            SunSpecType::Acc64 => ((value * descale) as u64).to_be_bytes().to_vec(),
            SunSpecType::Bitfield16 | SunSpecType::Enum16 => {
                (value as u16).to_be_bytes().to_vec()
            }
            SunSpecType::Bitfield32 | SunSpecType::Enum32 => {
                (value as u32).to_be_bytes().to_vec()
            }
            SunSpecType::Float32 => (value as f32).to_be_bytes().to_vec(),
            SunSpecType::Int16 | SunSpecType::Pad => {
                ((value * descale) as i16).to_be_bytes().to_vec()
            }
            SunSpecType::Int32 => ((value * descale) as i32).to_be_bytes().to_vec(),
            SunSpecType::Sunssf => (value as i16).to_be_bytes().to_vec(),
            SunSpecType::String8 | SunSpecType::String16 => return Err(SunSpecError::NotAValue),
        };

        Ok(buf)
    }

    /// Encode a string into the fixed-size, zero-padded field.
    pub fn string_bytes(&self, value: &str) -> Result<Vec<u8>, SunSpecError> {
        if !self.dtype.is_string() {
            return Err(SunSpecError::NotAString);
        }

        let mut buf = vec![0u8; self.count as usize * 2];
        let bytes = value.as_bytes();
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);

        Ok(buf)
    }

    /// Decode wire words into engineering units with the resolved scale
    /// exponent. With no data, returns the internal value.
    pub fn value(&self, data: Option<&[u8]>, scale: i32) -> Result<f64, SunSpecError> {
        let Some(data) = data else {
            return Ok(self.internal_value);
        };

        let want = self.count as usize * 2;
        if data.len() < want {
            return Err(SunSpecError::ShortFrame {
                name: self.name.clone(),
                got: data.len(),
                want,
            });
        }

        let upscale = 10f64.powi(scale);

        let value = match self.dtype {
            SunSpecType::Acc16 | SunSpecType::Uint16 => {
                u16::from_be_bytes([data[0], data[1]]) as f64 * upscale
            }
            SunSpecType::Acc32 | SunSpecType::Uint32 => {
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64 * upscale
            }
            SunSpecType::Acc64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[..8]);
                u64::from_be_bytes(buf) as f64 * upscale
            }
            SunSpecType::Bitfield16 | SunSpecType::Enum16 => {
                u16::from_be_bytes([data[0], data[1]]) as f64
            }
            SunSpecType::Bitfield32 | SunSpecType::Enum32 => {
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64
            }
            SunSpecType::Float32 => f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64,
            SunSpecType::Int16 | SunSpecType::Pad | SunSpecType::Sunssf => {
                let v = i16::from_be_bytes([data[0], data[1]]) as f64;
                if self.dtype == SunSpecType::Sunssf {
                    v
                } else {
                    v * upscale
                }
            }
            SunSpecType::Int32 => {
                i32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64 * upscale
            }
            SunSpecType::String8 | SunSpecType::String16 => return Err(SunSpecError::NotAValue),
        };

        Ok(value)
    }

    /// Decode a string field, trimming trailing NULs. With no data, returns
    /// the internal string.
    pub fn string(&self, data: Option<&[u8]>) -> Result<String, SunSpecError> {
        if !self.dtype.is_string() {
            return Err(SunSpecError::NotAString);
        }

        let Some(data) = data else {
            return Ok(self.internal_string.clone());
        };

        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).to_string())
    }

    /// The scale exponent to use when this register's own static scaling
    /// applies (no scale register resolved).
    pub fn static_scale(&self) -> i32 {
        self.scaling
    }

    /// Ignoring scaling, is this register's type affected by an exponent at
    /// all. Bitfields, enums, and floats never scale.
    pub fn scalable(&self) -> bool {
        self.dtype.scales()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        assert_eq!(SunSpecType::Sunssf.count(), 1);
        assert_eq!(SunSpecType::Acc32.count(), 2);
        assert_eq!(SunSpecType::Acc64.count(), 4);
        assert_eq!(SunSpecType::String8.count(), 8);
        assert_eq!(SunSpecType::String16.count(), 16);
    }

    #[test]
    fn scaled_uint16_roundtrip() {
        let reg = SsRegister::new("W", SunSpecType::Uint16);

        // engineering 4800 at sf=1 -> wire 480
        let wire = reg.bytes(4800.0, 1).unwrap();
        assert_eq!(wire, vec![0x01, 0xE0]);
        assert_eq!(reg.value(Some(&wire), 1).unwrap(), 4800.0);
    }

    #[test]
    fn negative_scale_factor() {
        let reg = SsRegister::new("A", SunSpecType::Int16);

        // engineering 12.3 at sf=-1 -> wire 123
        let wire = reg.bytes(12.3, -1).unwrap();
        assert_eq!(wire, vec![0x00, 0x7B]);
        let back = reg.value(Some(&wire), -1).unwrap();
        assert!((back - 12.3).abs() < 1e-6);
    }

    #[test]
    fn sunssf_encodes_raw_exponent() {
        let reg = SsRegister::new("W_SF", SunSpecType::Sunssf);
        let wire = reg.bytes(-2.0, 0).unwrap();
        assert_eq!(wire, vec![0xFF, 0xFE]);
        assert_eq!(reg.value(Some(&wire), 0).unwrap(), -2.0);
    }

    #[test]
    fn enum_ignores_scale() {
        let reg = SsRegister::new("St", SunSpecType::Enum16);
        let wire = reg.bytes(4.0, 3).unwrap();
        assert_eq!(wire, vec![0x00, 0x04]);
        assert_eq!(reg.value(Some(&wire), 3).unwrap(), 4.0);
    }

    #[test]
    fn string_roundtrip_pads_with_nuls() {
        let reg = SsRegister::new("Mn", SunSpecType::String8);

        let wire = reg.string_bytes("ACME").unwrap();
        assert_eq!(wire.len(), 16);
        assert_eq!(&wire[..4], b"ACME");
        assert!(wire[4..].iter().all(|b| *b == 0));

        assert_eq!(reg.string(Some(&wire)).unwrap(), "ACME");
    }

    #[test]
    fn string_accessor_on_value_register_fails() {
        let reg = SsRegister::new("A", SunSpecType::Uint16);
        assert!(reg.string(Some(&[0, 0])).is_err());
        assert!(SsRegister::new("Mn", SunSpecType::String8)
            .value(Some(&[0; 16]), 0)
            .is_err());
    }

    #[test]
    fn missing_data_uses_internal_values() {
        let mut reg = SsRegister::new("DA", SunSpecType::Uint16);
        reg.internal_value = 42.0;
        assert_eq!(reg.value(None, 0).unwrap(), 42.0);

        let mut reg = SsRegister::new("Mn", SunSpecType::String16);
        reg.internal_string = "naskel".into();
        assert_eq!(reg.string(None).unwrap(), "naskel");
    }
}
