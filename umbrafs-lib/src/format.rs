//! Wire format and tunable constants for UmbraFS
//!
//! Every message on the wire is {header, control payload, data payload},
//! little-endian. The control payload carries the typed request fields, the
//! data payload carries at most one block.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{UmbraFSError, UmbraFSResult};

/// Format and runtime constants
pub mod constants {
    /// Size of one block in bytes
    pub const BLOCK_SIZE: usize = 4096;

    /// Maximum data payload of one message (one block)
    pub const MAX_DATA_SIZE: usize = BLOCK_SIZE;

    /// Maximum control payload of one message
    pub const MAX_CTL_SIZE: usize = 255;

    /// Admission threshold for new dirtying callers
    pub const DIRTY_LIMIT: usize = 1024;

    /// Dirty-block backlog that triggers background writeback
    pub const WRITEBACK_THRESH: usize = 256;

    /// Maximum number of blocks in one dirty set
    pub const SET_LIMIT: usize = 64;

    /// Queue depth advertised by the network transport
    pub const NET_QUEUE_DEPTH: usize = 32;

    /// Queue depth of the local transport: one word of descriptor bits,
    /// minus one for slop
    pub const LOCAL_QUEUE_DEPTH: usize = u64::BITS as usize - 1;

    /// Listen backlog of the messaging listener
    pub const LISTEN_BACKLOG: i32 = 255;

    /// Number of distinct message types
    pub const MSG_TYPE_COUNT: usize = 6;
}

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    GetBlock = 0,
    GetBlockResult = 1,
    WriteBlock = 2,
    WriteBlockResult = 3,
    GetManifest = 4,
    GetManifestResult = 5,
}

impl MsgType {
    pub fn from_u8(v: u8) -> UmbraFSResult<Self> {
        match v {
            0 => Ok(MsgType::GetBlock),
            1 => Ok(MsgType::GetBlockResult),
            2 => Ok(MsgType::WriteBlock),
            3 => Ok(MsgType::WriteBlockResult),
            4 => Ok(MsgType::GetManifest),
            5 => Ok(MsgType::GetManifestResult),
            _ => Err(UmbraFSError::Protocol),
        }
    }
}

/// Block access intent carried by GET_BLOCK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Access {
    Read = 0,
    Write = 1,
}

impl Access {
    pub fn from_u8(v: u8) -> UmbraFSResult<Self> {
        match v {
            0 => Ok(Access::Read),
            1 => Ok(Access::Write),
            _ => Err(UmbraFSError::Protocol),
        }
    }
}

/// Closed set of error codes that travel on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireErr {
    Ok = 0,
    Unknown = 1,
    Io = 2,
    NoMemory = 3,
}

impl WireErr {
    /// Decode a wire error code; unknown codes are a protocol violation at
    /// the receiver
    pub fn from_u8(v: u8) -> UmbraFSResult<Self> {
        match v {
            0 => Ok(WireErr::Ok),
            1 => Ok(WireErr::Unknown),
            2 => Ok(WireErr::Io),
            3 => Ok(WireErr::NoMemory),
            _ => Err(UmbraFSError::Protocol),
        }
    }

    /// Map a local error onto the closed wire set
    pub fn from_error(err: Option<UmbraFSError>) -> Self {
        match err {
            None => WireErr::Ok,
            Some(UmbraFSError::Io(_)) => WireErr::Io,
            Some(UmbraFSError::OutOfMemory) => WireErr::NoMemory,
            Some(_) => WireErr::Unknown,
        }
    }

    /// Map a received wire code back to a local error
    pub fn to_error(self) -> Option<UmbraFSError> {
        match self {
            WireErr::Ok => None,
            WireErr::Unknown => Some(UmbraFSError::Protocol),
            WireErr::Io => Some(UmbraFSError::Io(-libc::EIO)),
            WireErr::NoMemory => Some(UmbraFSError::OutOfMemory),
        }
    }
}

/// Fixed 8-byte message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Reserved, not yet used
    pub crc: u32,
    /// Bytes of data payload following the control payload
    pub data_size: u16,
    /// Bytes of control payload following the header
    pub ctl_size: u8,
    /// Message type
    pub msg_type: u8,
}

impl MsgHeader {
    pub const SIZE: usize = 8;

    pub fn new(msg_type: MsgType, ctl_size: usize, data_size: usize) -> Self {
        Self {
            crc: 0,
            data_size: data_size as u16,
            ctl_size: ctl_size as u8,
            msg_type: msg_type as u8,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = &mut buf[..];
        w.write_u32::<LittleEndian>(self.crc).unwrap();
        w.write_u16::<LittleEndian>(self.data_size).unwrap();
        w.write_u8(self.ctl_size).unwrap();
        w.write_u8(self.msg_type).unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> UmbraFSResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(UmbraFSError::Protocol);
        }
        let mut r = buf;
        let header = Self {
            crc: r.read_u32::<LittleEndian>().unwrap(),
            data_size: r.read_u16::<LittleEndian>().unwrap(),
            ctl_size: r.read_u8().unwrap(),
            msg_type: r.read_u8().unwrap(),
        };
        header.validate()?;
        Ok(header)
    }

    /// Validate payload sizes and the type enumerator. A message must carry
    /// at least one payload; the data payload never exceeds one block.
    pub fn validate(&self) -> UmbraFSResult<()> {
        if self.data_size as usize > constants::MAX_DATA_SIZE {
            return Err(UmbraFSError::Protocol);
        }
        if self.ctl_size == 0 && self.data_size == 0 {
            return Err(UmbraFSError::Protocol);
        }
        MsgType::from_u8(self.msg_type)?;
        Ok(())
    }
}

/// GET_BLOCK control payload: 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlockCtl {
    pub bnr: u64,
    pub access: Access,
}

impl GetBlockCtl {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u64::<LittleEndian>(self.bnr).unwrap();
        buf.write_u8(self.access as u8).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> UmbraFSResult<Self> {
        if buf.len() != Self::SIZE {
            return Err(UmbraFSError::Protocol);
        }
        let bnr = buf.read_u64::<LittleEndian>().unwrap();
        let access = Access::from_u8(buf.read_u8().unwrap())?;
        Ok(Self { bnr, access })
    }
}

/// GET_BLOCK_RESULT control payload: 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlockResultCtl {
    pub bnr: u64,
    pub access: Access,
    pub err: WireErr,
}

impl GetBlockResultCtl {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u64::<LittleEndian>(self.bnr).unwrap();
        buf.write_u8(self.access as u8).unwrap();
        buf.write_u8(self.err as u8).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> UmbraFSResult<Self> {
        if buf.len() != Self::SIZE {
            return Err(UmbraFSError::Protocol);
        }
        let bnr = buf.read_u64::<LittleEndian>().unwrap();
        let access = Access::from_u8(buf.read_u8().unwrap())?;
        let err = WireErr::from_u8(buf.read_u8().unwrap())?;
        Ok(Self { bnr, access, err })
    }
}

/// WRITE_BLOCK control payload: 8 bytes, block data travels as data payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBlockCtl {
    pub bnr: u64,
}

impl WriteBlockCtl {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u64::<LittleEndian>(self.bnr).unwrap();
        buf
    }

    pub fn decode(mut buf: &[u8]) -> UmbraFSResult<Self> {
        if buf.len() != Self::SIZE {
            return Err(UmbraFSError::Protocol);
        }
        let bnr = buf.read_u64::<LittleEndian>().unwrap();
        Ok(Self { bnr })
    }
}

/// WRITE_BLOCK_RESULT control payload: 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBlockResultCtl {
    pub bnr: u64,
    pub err: WireErr,
}

impl WriteBlockResultCtl {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u64::<LittleEndian>(self.bnr).unwrap();
        buf.write_u8(self.err as u8).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> UmbraFSResult<Self> {
        if buf.len() != Self::SIZE {
            return Err(UmbraFSError::Protocol);
        }
        let bnr = buf.read_u64::<LittleEndian>().unwrap();
        let err = WireErr::from_u8(buf.read_u8().unwrap())?;
        Ok(Self { bnr, err })
    }
}

/// GET_MANIFEST control payload: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetManifestCtl {
    pub seq_nr: u64,
}

impl GetManifestCtl {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u64::<LittleEndian>(self.seq_nr).unwrap();
        buf
    }

    pub fn decode(mut buf: &[u8]) -> UmbraFSResult<Self> {
        if buf.len() != Self::SIZE {
            return Err(UmbraFSError::Protocol);
        }
        let seq_nr = buf.read_u64::<LittleEndian>().unwrap();
        Ok(Self { seq_nr })
    }
}

/// GET_MANIFEST_RESULT control payload: 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetManifestResultCtl {
    pub seq_nr: u64,
    pub err: WireErr,
}

impl GetManifestResultCtl {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u64::<LittleEndian>(self.seq_nr).unwrap();
        buf.write_u8(self.err as u8).unwrap();
        buf.resize(Self::SIZE, 0);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> UmbraFSResult<Self> {
        if buf.len() != Self::SIZE {
            return Err(UmbraFSError::Protocol);
        }
        let seq_nr = buf.read_u64::<LittleEndian>().unwrap();
        let err = WireErr::from_u8(buf.read_u8().unwrap())?;
        Ok(Self { seq_nr, err })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = MsgHeader::new(MsgType::GetBlock, GetBlockCtl::SIZE, 0);
        let decoded = MsgHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_empty_message() {
        let header = MsgHeader::new(MsgType::GetBlock, 0, 0);
        assert_eq!(
            MsgHeader::decode(&header.encode()),
            Err(UmbraFSError::Protocol)
        );
    }

    #[test]
    fn test_header_rejects_oversized_data() {
        let mut raw = MsgHeader::new(MsgType::GetBlockResult, 16, 4096).encode();
        // data_size = 4097
        raw[4] = 0x01;
        raw[5] = 0x10;
        assert_eq!(MsgHeader::decode(&raw), Err(UmbraFSError::Protocol));
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut raw = MsgHeader::new(MsgType::GetBlock, 16, 0).encode();
        raw[7] = 0x77;
        assert_eq!(MsgHeader::decode(&raw), Err(UmbraFSError::Protocol));
    }

    #[test]
    fn test_get_block_roundtrip() {
        let ctl = GetBlockCtl {
            bnr: 0x0102030405060708,
            access: Access::Read,
        };
        let encoded = ctl.encode();
        assert_eq!(encoded.len(), GetBlockCtl::SIZE);
        assert_eq!(GetBlockCtl::decode(&encoded).unwrap(), ctl);
    }

    #[test]
    fn test_result_ctl_roundtrips() {
        let ctl = GetBlockResultCtl {
            bnr: 7,
            access: Access::Write,
            err: WireErr::Io,
        };
        assert_eq!(GetBlockResultCtl::decode(&ctl.encode()).unwrap(), ctl);

        let ctl = WriteBlockResultCtl {
            bnr: 9,
            err: WireErr::Ok,
        };
        assert_eq!(WriteBlockResultCtl::decode(&ctl.encode()).unwrap(), ctl);

        let ctl = GetManifestResultCtl {
            seq_nr: 42,
            err: WireErr::NoMemory,
        };
        assert_eq!(GetManifestResultCtl::decode(&ctl.encode()).unwrap(), ctl);
    }

    #[test]
    fn test_unknown_wire_err_is_protocol_error() {
        let mut raw = WriteBlockResultCtl {
            bnr: 1,
            err: WireErr::Ok,
        }
        .encode();
        raw[8] = 0xEE;
        assert_eq!(
            WriteBlockResultCtl::decode(&raw),
            Err(UmbraFSError::Protocol)
        );
    }

    #[test]
    fn test_little_endian_layout() {
        let ctl = WriteBlockCtl { bnr: 0x0102030405060708 };
        let encoded = ctl.encode();
        assert_eq!(
            encoded,
            vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }
}
