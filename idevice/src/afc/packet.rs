//! AFC wire framing: a fixed 40 byte header, a variable header, then payload

use byteorder::{ByteOrder, LittleEndian};

use crate::IdeviceError;

pub const AFC_MAGIC: &[u8; 8] = b"CFA6LPAA";
pub const AFC_HEADER_LEN: u64 = 40;
/// Largest variable header plus payload accepted from a device
pub const AFC_MAX_BODY_LEN: u64 = 64 * 1024 * 1024;

/// AFC operation codes used by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Invalid = 0x00,
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    GetFileInfo = 0x0a,
    FileRefOpen = 0x0d,
    FileRefOpenResult = 0x0e,
    FileRefRead = 0x0f,
    FileRefSeek = 0x11,
    FileRefClose = 0x14,
}

impl AfcOpcode {
    pub fn from_u64(op: u64) -> Option<Self> {
        Some(match op {
            0x00 => Self::Invalid,
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x0a => Self::GetFileInfo,
            0x0d => Self::FileRefOpen,
            0x0e => Self::FileRefOpenResult,
            0x0f => Self::FileRefRead,
            0x11 => Self::FileRefSeek,
            0x14 => Self::FileRefClose,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfcPacketHeader {
    /// Fixed header, variable header and payload
    pub entire_length: u64,
    /// Fixed header and variable header
    pub this_length: u64,
    pub packet_num: u64,
    pub operation: u64,
}

impl AfcPacketHeader {
    pub fn new(operation: u64, packet_num: u64, header_len: usize, payload_len: usize) -> Self {
        let this_length = AFC_HEADER_LEN + header_len as u64;
        Self {
            entire_length: this_length + payload_len as u64,
            this_length,
            packet_num,
            operation,
        }
    }

    pub fn encode(&self) -> [u8; 40] {
        let mut buf = [0u8; 40];
        buf[..8].copy_from_slice(AFC_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.entire_length);
        LittleEndian::write_u64(&mut buf[16..24], self.this_length);
        LittleEndian::write_u64(&mut buf[24..32], self.packet_num);
        LittleEndian::write_u64(&mut buf[32..40], self.operation);
        buf
    }

    pub fn decode(buf: &[u8; 40]) -> Result<Self, IdeviceError> {
        if &buf[..8] != AFC_MAGIC {
            return Err(IdeviceError::ProtocolViolation(format!(
                "bad afc magic {:02x?}",
                &buf[..8]
            )));
        }
        let header = Self {
            entire_length: LittleEndian::read_u64(&buf[8..16]),
            this_length: LittleEndian::read_u64(&buf[16..24]),
            packet_num: LittleEndian::read_u64(&buf[24..32]),
            operation: LittleEndian::read_u64(&buf[32..40]),
        };
        if header.this_length < AFC_HEADER_LEN || header.entire_length < header.this_length {
            return Err(IdeviceError::ProtocolViolation(format!(
                "inconsistent afc lengths: entire {} this {}",
                header.entire_length, header.this_length
            )));
        }
        let body = header.entire_length - AFC_HEADER_LEN;
        if body > AFC_MAX_BODY_LEN || usize::try_from(body).is_err() {
            return Err(IdeviceError::ProtocolViolation(format!(
                "afc packet body of {body} bytes exceeds {AFC_MAX_BODY_LEN}"
            )));
        }
        Ok(header)
    }

    /// Bytes following the fixed header. Only meaningful for decoded headers.
    pub fn body_len(&self) -> usize {
        usize::try_from(self.entire_length.saturating_sub(AFC_HEADER_LEN)).unwrap_or(usize::MAX)
    }

    /// Where the variable header ends inside the body
    pub fn split_at(&self) -> usize {
        usize::try_from(self.this_length.saturating_sub(AFC_HEADER_LEN)).unwrap_or(usize::MAX)
    }
}

/// A decoded AFC response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfcPacket {
    pub packet_num: u64,
    pub operation: u64,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacket {
    pub(crate) fn from_parts(header: &AfcPacketHeader, mut body: Vec<u8>) -> Self {
        let payload = body.split_off(header.split_at());
        Self {
            packet_num: header.packet_num,
            operation: header.operation,
            header_payload: body,
            payload,
        }
    }

    pub fn opcode(&self) -> Option<AfcOpcode> {
        AfcOpcode::from_u64(self.operation)
    }

    /// The 8 byte code of a STATUS response
    pub fn status(&self) -> Option<u64> {
        match self.opcode() {
            Some(AfcOpcode::Status) if self.header_payload.len() == 8 => {
                Some(LittleEndian::read_u64(&self.header_payload))
            }
            _ => None,
        }
    }

    /// Checks the shape every response of this opcode class must have
    pub fn validate(&self) -> Result<(), IdeviceError> {
        match self.opcode() {
            Some(AfcOpcode::Invalid) => Err(IdeviceError::ProtocolViolation(
                "afc response with invalid opcode".into(),
            )),
            Some(AfcOpcode::Status | AfcOpcode::FileRefOpenResult)
                if self.header_payload.len() != 8 || !self.payload.is_empty() =>
            {
                Err(IdeviceError::ProtocolViolation(format!(
                    "afc status response with {} header bytes and {} payload bytes",
                    self.header_payload.len(),
                    self.payload.len()
                )))
            }
            Some(AfcOpcode::Data) if !self.header_payload.is_empty() => {
                Err(IdeviceError::ProtocolViolation(format!(
                    "afc data response with {} header bytes",
                    self.header_payload.len()
                )))
            }
            _ => Ok(()),
        }
    }
}
