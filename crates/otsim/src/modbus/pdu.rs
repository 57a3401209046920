// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Modbus PDU handling and framing.
//!
//! The PDU (function code + data) is shared between the TCP and RTU
//! transports; only the framing differs. TCP wraps the PDU in an MBAP
//! header, RTU appends a CRC-16:
//!
//! ```text
//! TCP:  [tid 2B][proto 2B = 0][len 2B][unit 1B][fc 1B][data ...]
//! RTU:  [unit 1B][fc 1B][data ...][crc 2B LE]
//! ```
//!
//! Servers implement [`PduHandler`]; the TCP server loop handles framing
//! and connection lifecycle. Clients use [`Client`] over either transport.

use crate::util::Shutdown;
use socket2::{Domain, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const MBAP_HEADER_LEN: usize = 7;
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Modbus protocol-level exception returned to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
}

impl Exception {
    pub fn code(&self) -> u8 {
        match self {
            Exception::IllegalFunction => 0x01,
            Exception::IllegalDataAddress => 0x02,
            Exception::IllegalDataValue => 0x03,
            Exception::SlaveDeviceFailure => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Exception::IllegalFunction,
            0x02 => Exception::IllegalDataAddress,
            0x03 => Exception::IllegalDataValue,
            _ => Exception::SlaveDeviceFailure,
        }
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Exception::IllegalFunction => "illegal function",
            Exception::IllegalDataAddress => "illegal data address",
            Exception::IllegalDataValue => "illegal data value",
            Exception::SlaveDeviceFailure => "slave device failure",
        };
        f.write_str(name)
    }
}

/// Client-side protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("peer returned exception for function {function:#04x}: {exception}")]
    Exception { function: u8, exception: Exception },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Server-side request handler: gets the PDU body after the function code,
/// returns the response body after the function code.
pub trait PduHandler: Send + Sync {
    fn handle(&self, function: u8, data: &[u8]) -> Result<Vec<u8>, Exception>;
}

/// Modbus CRC-16 (polynomial 0xA001, init 0xFFFF), as appended to RTU
/// frames low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Read exactly `buf.len()` bytes, tolerating read timeouts so the shutdown
/// token stays observable. With `allow_idle`, a timeout before the first
/// byte returns `Ok(false)` (no request pending); mid-frame timeouts always
/// keep waiting. Returns `Ok(false)` when shutdown trips.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    shutdown: &Shutdown,
    allow_idle: bool,
) -> io::Result<bool> {
    let mut read = 0;

    while read < buf.len() {
        if shutdown.is_tripped() {
            return Ok(false);
        }

        match stream.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ))
            }
            Ok(n) => read += n,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                if allow_idle && read == 0 {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

/// Modbus TCP server: accepts connections and services MBAP-framed requests
/// through the given handler until shutdown.
pub struct TcpServer {
    local_addr: SocketAddr,
}

impl TcpServer {
    pub fn bind(
        addr: SocketAddr,
        handler: Arc<dyn PduHandler>,
        shutdown: Shutdown,
    ) -> io::Result<Self> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(32)?;

        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        std::thread::Builder::new()
            .name("modbus-accept".into())
            .spawn(move || {
                while !shutdown.is_tripped() {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            log::debug!("[modbus] connection from {peer}");
                            let handler = handler.clone();
                            let shutdown = shutdown.clone();
                            let spawned = std::thread::Builder::new()
                                .name("modbus-conn".into())
                                .spawn(move || {
                                    if let Err(e) = serve_conn(stream, &*handler, &shutdown) {
                                        if e.kind() != io::ErrorKind::UnexpectedEof {
                                            log::debug!("[modbus] connection error: {e}");
                                        }
                                    }
                                });

                            if let Err(e) = spawned {
                                log::warn!("[modbus] spawning connection thread: {e}");
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            shutdown.wait_timeout(POLL_INTERVAL);
                        }
                        Err(e) => {
                            log::warn!("[modbus] accept: {e}");
                            shutdown.wait_timeout(POLL_INTERVAL);
                        }
                    }
                }
            })?;

        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn serve_conn(
    mut stream: TcpStream,
    handler: &dyn PduHandler,
    shutdown: &Shutdown,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    loop {
        let mut header = [0u8; MBAP_HEADER_LEN];
        if !read_full(&mut stream, &mut header, shutdown, true)? {
            if shutdown.is_tripped() {
                return Ok(());
            }
            continue;
        }

        let tid = u16::from_be_bytes([header[0], header[1]]);
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit = header[6];

        if len < 2 || len > 256 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad MBAP length {len}"),
            ));
        }

        let mut pdu = vec![0u8; len - 1];
        if !read_full(&mut stream, &mut pdu, shutdown, false)? {
            return Ok(());
        }

        let function = pdu[0];
        let response = handler.handle(function, &pdu[1..]);

        let mut out = Vec::with_capacity(MBAP_HEADER_LEN + 3);
        out.extend_from_slice(&tid.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());

        match response {
            Ok(data) => {
                out.extend_from_slice(&((data.len() + 2) as u16).to_be_bytes());
                out.push(unit);
                out.push(function);
                out.extend_from_slice(&data);
            }
            Err(exception) => {
                out.extend_from_slice(&3u16.to_be_bytes());
                out.push(unit);
                out.push(function | 0x80);
                out.push(exception.code());
            }
        }

        stream.write_all(&out)?;
    }
}

/// Client-side transport abstraction over TCP and serial RTU.
pub trait Transport: Send {
    /// Issue one request PDU, return the response body after the function
    /// code.
    fn execute(&mut self, function: u8, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

pub struct TcpTransport {
    stream: TcpStream,
    unit: u8,
    tid: u16,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr, unit: u8, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        Ok(Self {
            stream,
            unit,
            tid: 0,
        })
    }
}

impl Transport for TcpTransport {
    fn execute(&mut self, function: u8, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.tid = self.tid.wrapping_add(1);

        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + data.len());
        frame.extend_from_slice(&self.tid.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((data.len() + 2) as u16).to_be_bytes());
        frame.push(self.unit);
        frame.push(function);
        frame.extend_from_slice(data);

        self.stream.write_all(&frame)?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        self.stream.read_exact(&mut header)?;

        let tid = u16::from_be_bytes([header[0], header[1]]);
        if tid != self.tid {
            return Err(ProtocolError::Malformed(format!(
                "transaction id mismatch: sent {}, got {tid}",
                self.tid
            )));
        }

        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        if len < 2 {
            return Err(ProtocolError::Malformed(format!("bad MBAP length {len}")));
        }

        let mut pdu = vec![0u8; len - 1];
        self.stream.read_exact(&mut pdu)?;

        check_response(function, &pdu)
    }
}

pub struct RtuTransport {
    port: Box<dyn serialport::SerialPort>,
    unit: u8,
}

impl RtuTransport {
    pub fn new(port: Box<dyn serialport::SerialPort>, unit: u8) -> Self {
        Self { port, unit }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.port.read_exact(buf).map_err(ProtocolError::Io)
    }
}

impl Transport for RtuTransport {
    fn execute(&mut self, function: u8, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = Vec::with_capacity(2 + data.len() + 2);
        frame.push(self.unit);
        frame.push(function);
        frame.extend_from_slice(data);

        let crc = crc16(&frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);

        self.port.write_all(&frame)?;

        let mut head = [0u8; 2];
        self.read_exact(&mut head)?;

        let resp_function = head[1];

        // Exception response: one code byte plus CRC.
        if resp_function == function | 0x80 {
            let mut rest = [0u8; 3];
            self.read_exact(&mut rest)?;
            verify_crc(&[&head[..], &rest[..1]].concat(), &rest[1..])?;
            return Err(ProtocolError::Exception {
                function,
                exception: Exception::from_code(rest[0]),
            });
        }

        if resp_function != function {
            return Err(ProtocolError::Malformed(format!(
                "function mismatch: sent {function:#04x}, got {resp_function:#04x}"
            )));
        }

        let body_len = match function {
            READ_COILS | READ_DISCRETE_INPUTS | READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
                let mut count = [0u8; 1];
                self.read_exact(&mut count)?;
                let mut body = vec![0u8; count[0] as usize + 2];
                self.read_exact(&mut body)?;

                let mut pdu = vec![count[0]];
                pdu.extend_from_slice(&body[..count[0] as usize]);

                verify_crc(
                    &[&head[..], &pdu[..]].concat(),
                    &body[count[0] as usize..],
                )?;
                return check_response(function, &{
                    let mut full = vec![function];
                    full.extend_from_slice(&pdu);
                    full
                });
            }
            _ => 4,
        };

        let mut body = vec![0u8; body_len + 2];
        self.read_exact(&mut body)?;
        verify_crc(&[&head[..], &body[..body_len]].concat(), &body[body_len..])?;

        let mut pdu = vec![function];
        pdu.extend_from_slice(&body[..body_len]);
        check_response(function, &pdu)
    }
}

fn verify_crc(frame: &[u8], trailer: &[u8]) -> Result<(), ProtocolError> {
    let want = crc16(frame);
    let got = u16::from_le_bytes([trailer[0], trailer[1]]);

    if want != got {
        return Err(ProtocolError::Malformed(format!(
            "CRC mismatch: want {want:#06x}, got {got:#06x}"
        )));
    }

    Ok(())
}

fn check_response(function: u8, pdu: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if pdu.is_empty() {
        return Err(ProtocolError::Malformed("empty response PDU".into()));
    }

    let resp_function = pdu[0];

    if resp_function == function | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(ProtocolError::Exception {
            function,
            exception: Exception::from_code(code),
        });
    }

    if resp_function != function {
        return Err(ProtocolError::Malformed(format!(
            "function mismatch: sent {function:#04x}, got {resp_function:#04x}"
        )));
    }

    Ok(pdu[1..].to_vec())
}

/// Modbus client over any [`Transport`].
pub struct Client {
    transport: Box<dyn Transport>,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    fn read(&mut self, function: u8, addr: u16, count: u16) -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&addr.to_be_bytes());
        data.extend_from_slice(&count.to_be_bytes());

        let resp = self.transport.execute(function, &data)?;

        if resp.is_empty() {
            return Err(ProtocolError::Malformed("missing byte count".into()));
        }

        let byte_count = resp[0] as usize;
        if resp.len() < 1 + byte_count {
            return Err(ProtocolError::Malformed(format!(
                "short read payload: want {byte_count} bytes, got {}",
                resp.len() - 1
            )));
        }

        Ok(resp[1..1 + byte_count].to_vec())
    }

    /// FC 1; returns bit-packed bytes.
    pub fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, ProtocolError> {
        self.read(READ_COILS, addr, count)
    }

    /// FC 2; returns bit-packed bytes.
    pub fn read_discrete_inputs(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, ProtocolError> {
        self.read(READ_DISCRETE_INPUTS, addr, count)
    }

    /// FC 3; returns register bytes (2 per word).
    pub fn read_holding_registers(
        &mut self,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.read(READ_HOLDING_REGISTERS, addr, count)
    }

    /// FC 4; returns register bytes (2 per word).
    pub fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, ProtocolError> {
        self.read(READ_INPUT_REGISTERS, addr, count)
    }

    /// FC 5. `value` is the raw wire value (0x0000 or 0xFF00).
    pub fn write_single_coil(&mut self, addr: u16, value: u16) -> Result<(), ProtocolError> {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&addr.to_be_bytes());
        data.extend_from_slice(&value.to_be_bytes());

        self.transport.execute(WRITE_SINGLE_COIL, &data)?;
        Ok(())
    }

    /// FC 6.
    pub fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), ProtocolError> {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&addr.to_be_bytes());
        data.extend_from_slice(&value.to_be_bytes());

        self.transport.execute(WRITE_SINGLE_REGISTER, &data)?;
        Ok(())
    }

    /// FC 15. `packed` carries the coil values LSB-first.
    pub fn write_multiple_coils(
        &mut self,
        addr: u16,
        count: u16,
        packed: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut data = Vec::with_capacity(5 + packed.len());
        data.extend_from_slice(&addr.to_be_bytes());
        data.extend_from_slice(&count.to_be_bytes());
        data.push(packed.len() as u8);
        data.extend_from_slice(packed);

        self.transport.execute(WRITE_MULTIPLE_COILS, &data)?;
        Ok(())
    }

    /// FC 16. `data` carries `count` words of register bytes.
    pub fn write_multiple_registers(
        &mut self,
        addr: u16,
        count: u16,
        bytes: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut data = Vec::with_capacity(5 + bytes.len());
        data.extend_from_slice(&addr.to_be_bytes());
        data.extend_from_slice(&count.to_be_bytes());
        data.push(bytes.len() as u8);
        data.extend_from_slice(bytes);

        self.transport.execute(WRITE_MULTIPLE_REGISTERS, &data)?;
        Ok(())
    }
}
