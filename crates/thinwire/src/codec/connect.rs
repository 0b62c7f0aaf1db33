//! Payloads of the Connect, Accept and Refuse packets exchanged during
//! negotiation.

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::Result;

/// Oldest protocol version the client speaks.
pub const VERSION_MIN: u16 = 315;

/// Newest protocol version the client speaks.
pub const VERSION_MAX: u16 = 319;

/// Capability bits.
pub mod capability {
    /// Server returns per-row errors for batched DML instead of aborting.
    pub const BATCH_ERRORS: u32 = 0x0001;
    /// Per-row affected counts for batched DML.
    pub const DML_ROWCOUNTS: u32 = 0x0002;
    /// Rows may be returned together with the execute reply.
    pub const PREFETCH: u32 = 0x0004;
    /// Break/reset marker handshake on call failure.
    pub const MARKERS: u32 = 0x0008;
    /// Large object reads by locator.
    pub const LOB_READ: u32 = 0x0010;

    /// Everything this client understands.
    pub const CLIENT: u32 = BATCH_ERRORS | DML_ROWCOUNTS | PREFETCH | MARKERS | LOB_READ;
}

/// Refuse reason codes.
pub mod refuse_reason {
    pub const VERSION_MISMATCH: u8 = 1;
    pub const UNKNOWN_SERVICE: u8 = 2;
}

/// Client's opening offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version_min: u16,
    pub version_max: u16,
    pub sdu: u32,
    pub capabilities: u32,
    pub service: String,
}

impl ConnectRequest {
    pub fn encode(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_u16(self.version_min);
        buf.put_u16(self.version_max);
        buf.put_u32(self.sdu);
        buf.put_u32(self.capabilities);
        buf.put_str(&self.service)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = ReadBuffer::new(bytes);
        Ok(Self {
            version_min: buf.get_u16()?,
            version_max: buf.get_u16()?,
            sdu: buf.get_u32()?,
            capabilities: buf.get_u32()?,
            service: buf.get_string()?,
        })
    }
}

/// Server's acceptance, fixing version, SDU and capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptResponse {
    pub version: u16,
    pub sdu: u32,
    pub capabilities: u32,
}

impl AcceptResponse {
    pub fn encode(&self, buf: &mut WriteBuffer) {
        buf.put_u16(self.version);
        buf.put_u32(self.sdu);
        buf.put_u32(self.capabilities);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = ReadBuffer::new(bytes);
        Ok(Self {
            version: buf.get_u16()?,
            sdu: buf.get_u32()?,
            capabilities: buf.get_u32()?,
        })
    }
}

/// Server's refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefuseResponse {
    pub reason: u8,
    pub message: String,
}

impl RefuseResponse {
    pub fn encode(&self, buf: &mut WriteBuffer) -> Result<()> {
        buf.put_u8(self.reason);
        buf.put_str(&self.message)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = ReadBuffer::new(bytes);
        Ok(Self {
            reason: buf.get_u8()?,
            message: buf.get_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_layout() {
        let request = ConnectRequest {
            version_min: VERSION_MIN,
            version_max: VERSION_MAX,
            sdu: 8192,
            capabilities: capability::CLIENT,
            service: "FREEPDB1".into(),
        };
        let mut buf = WriteBuffer::default();
        request.encode(&mut buf).unwrap();
        assert_eq!(&buf.as_slice()[..4], &[0x01, 0x3B, 0x01, 0x3F]);
        assert_eq!(ConnectRequest::decode(buf.as_slice()).unwrap(), request);
    }

    #[test]
    fn test_refuse_decode_truncated() {
        assert!(RefuseResponse::decode(&[1, 0, 0]).unwrap_err().is_protocol());
    }
}
