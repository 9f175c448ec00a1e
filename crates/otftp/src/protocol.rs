//! TFTP Protocol Implementation
//!
//! This module contains the packet codec: the five RFC 1350 packet types,
//! their wire layout and the protocol constants.
//!
//! # Wire Layout
//!
//! All multi-byte integers are big-endian.
//!
//! | Opcode | Layout |
//! |---|---|
//! | 1 RRQ | opcode · filename · 0 · mode · 0 |
//! | 2 WRQ | opcode · filename · 0 · mode · 0 |
//! | 3 DATA | opcode · block · payload (0..512 bytes) |
//! | 4 ACK | opcode · block |
//! | 5 ERROR | opcode · error code · message · 0 |
//!
//! Option extensions (RFC 2347) are not negotiated. Anything trailing the mode
//! string of a request is ignored.

use std::fmt;
use std::str::FromStr;

use crate::error::PacketError;

/// Fixed TFTP block size (RFC 1350)
pub const BLOCK_SIZE: usize = 512;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// The last packet of a transfer carries fewer than 512 bytes, possibly none.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// ACK 0 answers a write request.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Terminates the current transfer.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use otftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(6), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see the message
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Permission problems, and any attempt to reach outside the served tree.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    ///
    /// Write requests never overwrite.
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use otftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(6), Some(TftpErrorCode::FileAlreadyExists));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, bytes are transferred as-is
    ///
    /// Mode string: "octet"
    Octet,

    /// Text mode, line endings are transcoded to and from CR-LF
    ///
    /// Mode string: "netascii"
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode, case-insensitively
    ///
    /// # Examples
    /// ```
    /// use otftp::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("octet"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("NETASCII"), Some(TransferMode::NetAscii));
    /// assert_eq!(TransferMode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }
}

impl FromStr for TransferMode {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| PacketError::UnsupportedMode(s.to_string()))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a transfer, seen from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// RRQ: the server sends the file
    Read,
    /// WRQ: the server receives the file
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// TFTP Request (RRQ/WRQ) representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpRequest {
    pub direction: Direction,
    /// Requested filename, as sent by the client
    pub filename: String,
    pub mode: TransferMode,
}

impl TftpRequest {
    /// Create a new read request
    ///
    /// # Examples
    /// ```
    /// use otftp::{Direction, TftpRequest, TransferMode};
    ///
    /// let request = TftpRequest::read_request("Texts.Mod", TransferMode::Octet);
    /// assert_eq!(request.filename, "Texts.Mod");
    /// assert_eq!(request.direction, Direction::Read);
    /// ```
    pub fn read_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            direction: Direction::Read,
            filename: filename.into(),
            mode,
        }
    }

    /// Create a new write request
    pub fn write_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            direction: Direction::Write,
            filename: filename.into(),
            mode,
        }
    }
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: TransferMode },
    Wrq { filename: String, mode: TransferMode },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    /// Build an ERROR packet from a well-known code
    pub fn error(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::Rrq { .. } => TftpOpcode::ReadRequest,
            Self::Wrq { .. } => TftpOpcode::WriteRequest,
            Self::Data { .. } => TftpOpcode::Data,
            Self::Ack { .. } => TftpOpcode::Acknowledgment,
            Self::Error { .. } => TftpOpcode::Error,
        }
    }

    /// Turn an RRQ/WRQ into a request, `None` for any other packet
    pub fn into_request(self) -> Option<TftpRequest> {
        match self {
            Self::Rrq { filename, mode } => Some(TftpRequest::read_request(filename, mode)),
            Self::Wrq { filename, mode } => Some(TftpRequest::write_request(filename, mode)),
            _ => None,
        }
    }

    /// Decode a datagram
    ///
    /// # Examples
    /// ```
    /// use otftp::Packet;
    ///
    /// assert_eq!(Packet::decode(&[0, 4, 0, 7]), Ok(Packet::Ack { block: 7 }));
    /// assert!(Packet::decode(&[0, 9]).is_err());
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::malformed("packet too short"));
        }

        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode =
            TftpOpcode::from_u16(raw).ok_or_else(|| PacketError::malformed(format!("unknown opcode {}", raw)))?;
        let body = &buf[2..];

        match opcode {
            TftpOpcode::ReadRequest => {
                let (filename, mode) = parse_request(body)?;
                Ok(Self::Rrq { filename, mode })
            }
            TftpOpcode::WriteRequest => {
                let (filename, mode) = parse_request(body)?;
                Ok(Self::Wrq { filename, mode })
            }
            TftpOpcode::Data => {
                let block = parse_block(body, "DATA")?;
                if body.len() - 2 > BLOCK_SIZE {
                    return Err(PacketError::malformed(format!(
                        "DATA payload of {} bytes exceeds {}",
                        body.len() - 2,
                        BLOCK_SIZE
                    )));
                }
                Ok(Self::Data {
                    block,
                    payload: body[2..].to_vec(),
                })
            }
            TftpOpcode::Acknowledgment => Ok(Self::Ack {
                block: parse_block(body, "ACK")?,
            }),
            TftpOpcode::Error => {
                let code = parse_block(body, "ERROR")?;
                let (message, _) = parse_string(&body[2..], 0, "error message")?;
                Ok(Self::Error { code, message })
            }
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Rrq { filename, mode } => build_request(TftpOpcode::ReadRequest, filename, *mode),
            Self::Wrq { filename, mode } => build_request(TftpOpcode::WriteRequest, filename, *mode),
            Self::Data { block, payload } => build_data(*block, payload),
            Self::Ack { block } => build_ack(*block),
            Self::Error { code, message } => build_error(*code, message),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rrq { filename, mode } | Self::Wrq { filename, mode } => {
                write!(f, "{} '{}' ({})", self.opcode(), filename, mode)
            }
            Self::Data { block, payload } => write!(f, "DATA #{} ({} bytes)", block, payload.len()),
            Self::Ack { block } => write!(f, "ACK #{}", block),
            Self::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
        }
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Read a NUL-terminated string at `start`, returning it and the index past the NUL
fn parse_string(buf: &[u8], start: usize, what: &str) -> Result<(String, usize), PacketError> {
    let end = find_zero(buf, start).ok_or_else(|| PacketError::malformed(format!("{} not terminated", what)))?;
    let s = std::str::from_utf8(&buf[start..end])
        .map_err(|_| PacketError::malformed(format!("{} is not valid text", what)))?;
    Ok((s.to_string(), end + 1))
}

fn parse_request(body: &[u8]) -> Result<(String, TransferMode), PacketError> {
    let (filename, i) = parse_string(body, 0, "filename")?;
    let (mode, _) = parse_string(body, i, "mode")?;
    Ok((filename, mode.parse()?))
}

fn parse_block(body: &[u8], what: &str) -> Result<u16, PacketError> {
    if body.len() < 2 {
        return Err(PacketError::malformed(format!("{} too short", what)));
    }
    Ok(u16::from_be_bytes([body[0], body[1]]))
}

fn build_request(opcode: TftpOpcode, filename: &str, mode: TransferMode) -> Vec<u8> {
    let mode = mode.as_str();
    let mut v = Vec::with_capacity(4 + filename.len() + mode.len());
    v.extend_from_slice(&opcode.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_bytes());
    v.push(0);
    v
}

/// Build a TFTP Data packet
pub fn build_data(block: u16, data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + data.len());
    v.extend_from_slice(&TftpOpcode::Data.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v.extend_from_slice(data);
    v
}

/// Build a TFTP ACK packet
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(4);
    v.extend_from_slice(&TftpOpcode::Acknowledgment.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

/// Build a TFTP Error packet
pub fn build_error(code: u16, msg: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + msg.len() + 1);
    v.extend_from_slice(&TftpOpcode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.to_be_bytes());
    v.extend_from_slice(msg.as_bytes());
    v.push(0);
    v
}
