//! Wire formats shared by the sender and the receiver daemon.
//!
//! The control connection (TCP) carries fixed-layout big-endian headers
//! followed by variable payloads: a fixed summary and an optional
//! self-describing probe-stamp vector (JSON, versioned implicitly by the
//! control protocol). The probe stream (UDP) carries an 8-byte big-endian
//! header followed by zero padding up to the configured packet size.

use crate::time::MicroTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default UDP port the receiver listens on for probe packets.
pub const PROBE_PORT: u16 = 13979;

/// Default TCP port the receiver listens on for the control connection.
pub const CTRL_PORT: u16 = 13989;

/// Size of the fixed control message header on the wire.
pub const CTRL_HEADER_LEN: usize = 20;

/// Size of the fixed RST-ACK summary payload on the wire.
pub const RST_SUMMARY_LEN: usize = 20;

/// Size of the probe packet header (stream + sequence).
pub const PROBE_HEADER_LEN: usize = 8;

/// IPv4 header size without options; probe packet sizes are specified
/// inclusive of IP and UDP headers.
pub const IPV4_HEADER_LEN: usize = 20;

/// UDP header size.
pub const UDP_HEADER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("unknown control code: {0}")]
    BadCode(u32),

    #[error("short buffer: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("probe stamp vector: {0}")]
    Stamps(#[from] serde_json::Error),
}

/// Control message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CtrlCode {
    /// Sender -> receiver: close out the current measurement and report it.
    Rst = 1,
    /// Receiver -> sender: measurement summary follows.
    RstAck = 2,
    /// Receiver -> sender: the measurement was unusable; nothing follows.
    RstNack = 3,
}

impl CtrlCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(CtrlCode::Rst),
            2 => Some(CtrlCode::RstAck),
            3 => Some(CtrlCode::RstNack),
            _ => None,
        }
    }
}

/// Fixed control message header, network byte order on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlHeader {
    pub code: CtrlCode,
    /// Bytes of summary payload following the header.
    pub len: u32,
    /// Bytes of serialized probe-stamp vector following the summary.
    pub ps_vec_len: u32,
    /// Sender-assigned request id, echoed by the receiver.
    pub seq: u32,
    /// Receiver-defined; 0 on success.
    pub reason: u32,
}

impl CtrlHeader {
    /// A bare request header carrying only a code and a sequence number.
    pub fn request(code: CtrlCode, seq: u32) -> Self {
        Self {
            code,
            len: 0,
            ps_vec_len: 0,
            seq,
            reason: 0,
        }
    }

    pub fn encode(&self) -> [u8; CTRL_HEADER_LEN] {
        let mut buf = [0u8; CTRL_HEADER_LEN];
        buf[0..4].copy_from_slice(&(self.code as u32).to_be_bytes());
        buf[4..8].copy_from_slice(&self.len.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ps_vec_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.seq.to_be_bytes());
        buf[16..20].copy_from_slice(&self.reason.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < CTRL_HEADER_LEN {
            return Err(ProtoError::Truncated {
                need: CTRL_HEADER_LEN,
                have: buf.len(),
            });
        }
        let raw_code = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let code = CtrlCode::from_u32(raw_code).ok_or(ProtoError::BadCode(raw_code))?;
        Ok(Self {
            code,
            len: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            ps_vec_len: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            seq: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            reason: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// RST-ACK summary payload: the receiver's view of the last stream.
/// Spacings are mean inter-probe gaps in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RstSummary {
    pub app_mean: u32,
    pub pcap_mean: u32,
    pub ttl: u32,
    pub nsamples: u32,
    pub nlost: u32,
}

impl RstSummary {
    pub fn encode(&self) -> [u8; RST_SUMMARY_LEN] {
        let mut buf = [0u8; RST_SUMMARY_LEN];
        buf[0..4].copy_from_slice(&self.app_mean.to_be_bytes());
        buf[4..8].copy_from_slice(&self.pcap_mean.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ttl.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nsamples.to_be_bytes());
        buf[16..20].copy_from_slice(&self.nlost.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < RST_SUMMARY_LEN {
            return Err(ProtoError::Truncated {
                need: RST_SUMMARY_LEN,
                have: buf.len(),
            });
        }
        Ok(Self {
            app_mean: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            pcap_mean: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            ttl: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            nsamples: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            nlost: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// One observed probe, stamped either at send time (sender) or at arrival
/// (receiver, or the local capture layer). Immutable once stamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeStamp {
    pub stream: u32,
    pub sequence: u32,
    pub ts: MicroTime,
    pub ttl: u8,
}

/// Serialize a probe-stamp vector for the control channel.
pub fn encode_stamps(stamps: &[ProbeStamp]) -> Result<Vec<u8>, ProtoError> {
    Ok(serde_json::to_vec(stamps)?)
}

/// Deserialize a probe-stamp vector received on the control channel.
pub fn decode_stamps(buf: &[u8]) -> Result<Vec<ProbeStamp>, ProtoError> {
    Ok(serde_json::from_slice(buf)?)
}

/// Write the probe packet header into the head of a payload buffer.
/// The rest of the buffer is padding and is left untouched.
pub fn write_probe_header(buf: &mut [u8], stream: u32, sequence: u32) {
    buf[0..4].copy_from_slice(&stream.to_be_bytes());
    buf[4..8].copy_from_slice(&sequence.to_be_bytes());
}

/// Parse the probe packet header from a UDP payload.
pub fn parse_probe_header(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < PROBE_HEADER_LEN {
        return None;
    }
    let stream = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let sequence = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    Some((stream, sequence))
}
