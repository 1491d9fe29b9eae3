//! The control channel: a persistent TCP connection to the receiver over
//! which each probe stream is closed out and its result collected.

use crate::error::{Result, SenderError};
use fathom_common::{
    decode_stamps, CtrlCode, CtrlHeader, ProbeStamp, RstSummary, CTRL_HEADER_LEN, RST_SUMMARY_LEN,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Outcome of one RST round trip.
#[derive(Debug)]
pub enum RstReply {
    /// The receiver reported a measurement, possibly with per-probe stamps.
    Ack {
        summary: RstSummary,
        stamps: Vec<ProbeStamp>,
    },
    /// The receiver saw the stream but judged the measurement unusable.
    Nack,
    /// Nothing arrived within the control timeout.
    TimedOut,
}

pub struct ControlChannel {
    stream: TcpStream,
    seq: u32,
}

impl ControlChannel {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, seq: 0 })
    }

    /// Send a RST and wait for the receiver's verdict. Polls in one-second
    /// slices so a dead receiver is noticed within `timeout` rather than
    /// hanging the run. The sequence number advances only on a successful
    /// ACK, mirroring what the receiver acknowledged.
    pub fn reset_round_trip(&mut self, timeout: Duration) -> Result<RstReply> {
        let request = CtrlHeader::request(CtrlCode::Rst, self.seq);
        self.stream.write_all(&request.encode())?;

        let start = Instant::now();
        let mut hdr_buf = [0u8; CTRL_HEADER_LEN];
        if !self.read_full(&mut hdr_buf, start, timeout)? {
            return Ok(RstReply::TimedOut);
        }
        let header = CtrlHeader::decode(&hdr_buf)?;

        match header.code {
            CtrlCode::RstNack => return Ok(RstReply::Nack),
            CtrlCode::RstAck => {}
            other => {
                return Err(SenderError::Protocol(format!(
                    "unexpected control code {:?} in reply",
                    other
                )))
            }
        }
        if header.seq != request.seq {
            return Err(SenderError::Protocol(format!(
                "reply seq {} does not match request seq {}",
                header.seq, request.seq
            )));
        }
        if header.reason != 0 {
            tracing::warn!("## receiver reported reason {} on RST-ACK", header.reason);
        }

        let mut summary_buf = vec![0u8; header.len as usize];
        if !self.read_full(&mut summary_buf, start, timeout)? {
            return Ok(RstReply::TimedOut);
        }
        if summary_buf.len() < RST_SUMMARY_LEN {
            return Err(SenderError::Protocol(format!(
                "RST-ACK summary too short: {} bytes",
                summary_buf.len()
            )));
        }
        let summary = RstSummary::decode(&summary_buf)?;

        let stamps = if header.ps_vec_len > 0 {
            let mut vec_buf = vec![0u8; header.ps_vec_len as usize];
            if !self.read_full(&mut vec_buf, start, timeout)? {
                return Ok(RstReply::TimedOut);
            }
            decode_stamps(&vec_buf)?
        } else {
            Vec::new()
        };

        self.seq = self.seq.wrapping_add(1);
        Ok(RstReply::Ack { summary, stamps })
    }

    /// Fill `buf`, polling in one-second slices against the shared deadline.
    /// Returns false when the deadline passed first. A closed peer is a
    /// transport error: the receiver is gone for good.
    fn read_full(&mut self, buf: &mut [u8], start: Instant, timeout: Duration) -> Result<bool> {
        let mut offset = 0;
        while offset < buf.len() {
            self.stream
                .set_read_timeout(Some(Duration::from_secs(1)))?;
            match self.stream.read(&mut buf[offset..]) {
                Ok(0) => {
                    return Err(SenderError::Protocol(
                        "receiver closed the control connection".into(),
                    ))
                }
                Ok(n) => offset += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if start.elapsed() > timeout {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}
