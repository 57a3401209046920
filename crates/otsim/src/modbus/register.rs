// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed Modbus register bound to a bus tag.
//!
//! A register translates between the big-endian multi-word frames seen on
//! the wire and the floating-point tag values carried on the bus. Integer
//! data types carry a power-of-ten scaling: the stored (engineering) value
//! is `raw / 10^scaling`, so encoding multiplies by `10^scaling` and then
//! truncates to the declared width.

use super::bits::bytes_to_bits;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid register type '{0}' provided")]
    InvalidType(String),

    #[error("invalid register data type '{0}' provided")]
    InvalidDataType(String),

    #[error("short frame for {rtype} register {addr}: got {got} bytes, want {want}")]
    ShortFrame {
        rtype: RegisterType,
        addr: u16,
        got: usize,
        want: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    Coil,
    Discrete,
    Input,
    Holding,
}

impl RegisterType {
    pub fn parse(s: &str) -> Result<Self, RegisterError> {
        match s {
            "coil" => Ok(RegisterType::Coil),
            "discrete" => Ok(RegisterType::Discrete),
            "input" => Ok(RegisterType::Input),
            "holding" => Ok(RegisterType::Holding),
            other => Err(RegisterError::InvalidType(other.to_string())),
        }
    }

    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }
}

impl std::fmt::Display for RegisterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Input => "input",
            RegisterType::Holding => "holding",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    Int16,
    #[default]
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl DataType {
    pub fn parse(s: &str) -> Result<Self, RegisterError> {
        match s {
            "int16" => Ok(DataType::Int16),
            "uint16" => Ok(DataType::Uint16),
            "int32" => Ok(DataType::Int32),
            "uint32" => Ok(DataType::Uint32),
            "int64" => Ok(DataType::Int64),
            "uint64" => Ok(DataType::Uint64),
            "float" | "float32" => Ok(DataType::Float32),
            "double" | "float64" => Ok(DataType::Float64),
            other => Err(RegisterError::InvalidDataType(other.to_string())),
        }
    }

    /// Word count (16-bit registers) occupied by this data type.
    pub fn count(&self) -> u16 {
        match self {
            DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 4,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::Float32 | DataType::Float64)
    }
}

/// A protocol-visible storage slot bound to a tag.
#[derive(Debug, Clone)]
pub struct Register {
    pub rtype: RegisterType,
    pub dtype: DataType,

    pub addr: u16,
    pub count: u16,
    pub scaling: i32,

    pub tag: String,
}

impl Register {
    pub fn new(rtype: RegisterType, dtype: DataType, addr: u16, scaling: i32, tag: &str) -> Self {
        let mut reg = Self {
            rtype,
            dtype,
            addr,
            count: 0,
            scaling,
            tag: tag.to_string(),
        };
        reg.init();
        reg
    }

    /// Derive the word count and normalize scaling. Bit registers always
    /// occupy a single bit regardless of data type.
    pub fn init(&mut self) {
        self.count = if self.rtype.is_bit() {
            1
        } else {
            self.dtype.count()
        };

        // backwards compatibility: scaling was historically given negative
        self.scaling = self.scaling.abs();
    }

    /// The wire-side value for `value`, for logging parity with the peer.
    pub fn scaled(&self, value: f64) -> f64 {
        if self.rtype.is_bit() || !self.dtype.is_integer() {
            return value;
        }

        value * 10f64.powi(self.scaling)
    }

    /// Encode a tag value into a big-endian frame of `count * 2` bytes
    /// (2 bytes for bit registers: `FF 00` or `00 00`).
    pub fn bytes(&self, value: f64) -> Result<Vec<u8>, RegisterError> {
        if self.rtype.is_bit() {
            // 0xFF00, per Modbus spec
            let v: u16 = if value == 0.0 { 0x0000 } else { 0xFF00 };
            return Ok(v.to_be_bytes().to_vec());
        }

        let scaled = value * 10f64.powi(self.scaling);

        let buf = match self.dtype {
            DataType::Int16 => (scaled as i16).to_be_bytes().to_vec(),
            DataType::Uint16 => (scaled as u16).to_be_bytes().to_vec(),
            DataType::Int32 => (scaled as i32).to_be_bytes().to_vec(),
            DataType::Uint32 => (scaled as u32).to_be_bytes().to_vec(),
            DataType::Int64 => (scaled as i64).to_be_bytes().to_vec(),
            DataType::Uint64 => (scaled as u64).to_be_bytes().to_vec(),
            DataType::Float32 => (value as f32).to_be_bytes().to_vec(),
            DataType::Float64 => value.to_be_bytes().to_vec(),
        };

        Ok(buf)
    }

    /// Decode a frame into a tag value, applying the negative-power scaling.
    /// For bit registers, reads bit 0 of the first byte (LSB-first packing).
    pub fn value(&self, data: &[u8]) -> Result<f64, RegisterError> {
        if self.rtype.is_bit() {
            if data.is_empty() {
                return Err(self.short_frame(data.len(), 1));
            }

            let bits = bytes_to_bits(data);
            return Ok(bits[0] as f64);
        }

        let want = self.count as usize * 2;
        if data.len() < want {
            return Err(self.short_frame(data.len(), want));
        }

        let unscale = 10f64.powi(-self.scaling);

        let value = match self.dtype {
            DataType::Int16 => i16::from_be_bytes([data[0], data[1]]) as f64 * unscale,
            DataType::Uint16 => u16::from_be_bytes([data[0], data[1]]) as f64 * unscale,
            DataType::Int32 => {
                i32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64 * unscale
            }
            DataType::Uint32 => {
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64 * unscale
            }
            DataType::Int64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[..8]);
                i64::from_be_bytes(buf) as f64 * unscale
            }
            DataType::Uint64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[..8]);
                u64::from_be_bytes(buf) as f64 * unscale
            }
            DataType::Float32 => f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64,
            DataType::Float64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[..8]);
                f64::from_be_bytes(buf)
            }
        };

        Ok(value)
    }

    fn short_frame(&self, got: usize, want: usize) -> RegisterError {
        RegisterError::ShortFrame {
            rtype: self.rtype,
            addr: self.addr,
            got,
            want,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_derivation() {
        for (dtype, count) in [
            (DataType::Int16, 1),
            (DataType::Uint16, 1),
            (DataType::Int32, 2),
            (DataType::Uint32, 2),
            (DataType::Float32, 2),
            (DataType::Int64, 4),
            (DataType::Uint64, 4),
            (DataType::Float64, 4),
        ] {
            let reg = Register::new(RegisterType::Holding, dtype, 0, 0, "t");
            assert_eq!(reg.count, count, "{dtype:?}");
        }

        let coil = Register::new(RegisterType::Coil, DataType::Uint16, 0, 0, "t");
        assert_eq!(coil.count, 1);
    }

    #[test]
    fn scaling_normalized_to_absolute() {
        let reg = Register::new(RegisterType::Holding, DataType::Uint16, 0, -2, "t");
        assert_eq!(reg.scaling, 2);
    }

    #[test]
    fn coil_bytes() {
        let reg = Register::new(RegisterType::Coil, DataType::Uint16, 0, 0, "sw.breaker");
        assert_eq!(reg.bytes(0.0).unwrap(), vec![0x00, 0x00]);
        assert_eq!(reg.bytes(1.0).unwrap(), vec![0xFF, 0x00]);
        assert_eq!(reg.bytes(42.0).unwrap(), vec![0xFF, 0x00]);
    }

    #[test]
    fn coil_value_reads_lsb() {
        let reg = Register::new(RegisterType::Coil, DataType::Uint16, 0, 0, "sw.breaker");
        assert_eq!(reg.value(&[0x01]).unwrap(), 1.0);
        assert_eq!(reg.value(&[0x00]).unwrap(), 0.0);
        assert_eq!(reg.value(&[0xFF, 0x00]).unwrap(), 1.0);
    }

    #[test]
    fn scaled_uint32_encoding() {
        // 480.0 at scaling 2 -> 48000 -> 00 00 BB 80
        let reg = Register::new(RegisterType::Input, DataType::Uint32, 10, 2, "v");
        assert_eq!(reg.bytes(480.0).unwrap(), vec![0x00, 0x00, 0xBB, 0x80]);
        assert_eq!(reg.value(&[0x00, 0x00, 0xBB, 0x80]).unwrap(), 480.0);
    }

    #[test]
    fn roundtrip_within_tolerance() {
        let cases = [
            (DataType::Int16, -2, -123.0),
            (DataType::Uint16, 1, 310.7),
            (DataType::Int32, 3, -12.345),
            (DataType::Uint32, 0, 65536.0),
            (DataType::Int64, 2, -99999.99),
            (DataType::Uint64, 0, 1.0e12),
            (DataType::Float32, 0, 3.14),
            (DataType::Float64, 0, 2.718281828459045),
        ];

        for (dtype, scaling, value) in cases {
            let reg = Register::new(RegisterType::Holding, dtype, 0, scaling, "t");
            let frame = reg.bytes(value).unwrap();
            assert_eq!(frame.len(), reg.count as usize * 2, "{dtype:?}");

            let back = reg.value(&frame).unwrap();
            let tolerance = if dtype == DataType::Float32 { 1e-5 } else { 1e-6 };
            assert!(
                (back - value).abs() < tolerance,
                "{dtype:?}: {value} -> {back}"
            );
        }
    }

    #[test]
    fn short_frame_is_error() {
        let reg = Register::new(RegisterType::Holding, DataType::Uint32, 7, 0, "t");
        assert!(reg.value(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn parse_aliases() {
        assert_eq!(DataType::parse("float").unwrap(), DataType::Float32);
        assert_eq!(DataType::parse("double").unwrap(), DataType::Float64);
        assert!(DataType::parse("string8").is_err());
        assert!(RegisterType::parse("register").is_err());
    }
}
