//! Out-of-band capture timing for locally sent probes.
//!
//! A background thread captures the probe stream on the wire and records a
//! stamp per observed probe, giving a second timing source that is immune
//! to application-level scheduling noise and carries the on-wire TTL. The
//! core only ever sees the shared buffer; when capture is unavailable the
//! capture-layer fields fall back to the application-layer values.

use fathom_common::time::MicroTime;
use fathom_common::{parse_probe_header, ProbeStamp, UDP_HEADER_LEN};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Probe stamps produced by the capture thread, consumed by the control
/// exchange after each stream. The mutex is held only to push or to
/// read-and-clear.
#[derive(Default)]
pub struct CaptureBuffer {
    probes: Mutex<Vec<ProbeStamp>>,
}

impl CaptureBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, stamp: ProbeStamp) {
        self.probes.lock().push(stamp);
    }

    pub fn len(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll in 10 ms slices until the buffer holds at least `count` stamps
    /// or `timeout` elapses. Returns whether the count was reached; on a
    /// miss the caller proceeds with the smaller set.
    pub fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Take everything captured so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<ProbeStamp> {
        std::mem::take(&mut *self.probes.lock())
    }
}

/// Parse one captured frame into a probe stamp. `link_offset` is the size
/// of the link-layer header for the capture device. Only probes leaving
/// this host are of interest, so the IPv4 destination must be the target
/// and the UDP destination port must be the probe port.
pub fn parse_probe_record(
    frame: &[u8],
    link_offset: usize,
    target: Ipv4Addr,
    probe_port: u16,
    ts: MicroTime,
) -> Option<ProbeStamp> {
    let ip = frame.get(link_offset..)?;
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    if ihl < 20 || ip.len() < ihl + UDP_HEADER_LEN {
        return None;
    }
    let ttl = ip[8];
    if ip[9] != 17 {
        return None; // not UDP
    }
    let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    if dst != target {
        return None;
    }

    let udp = &ip[ihl..];
    let dport = u16::from_be_bytes([udp[2], udp[3]]);
    if dport != probe_port {
        return None;
    }

    let payload = udp.get(UDP_HEADER_LEN..)?;
    let (stream, sequence) = parse_probe_header(payload)?;
    Some(ProbeStamp {
        stream,
        sequence,
        ts,
        ttl,
    })
}

#[cfg(feature = "pcap")]
pub use live::start_capture;

#[cfg(feature = "pcap")]
mod live {
    use super::*;
    use crate::error::{Result, SenderError};
    use pcap::{Capture, Device, Linktype};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::JoinHandle;

    /// Start the capture thread with a `udp and host <target>` filter.
    /// The thread runs until `running` goes false.
    pub fn start_capture(
        buffer: Arc<CaptureBuffer>,
        device: Option<String>,
        target: Ipv4Addr,
        probe_port: u16,
        running: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let device = match device {
            Some(name) => Device::from(name.as_str()),
            None => Device::lookup()
                .map_err(|e| SenderError::Config(format!("pcap device lookup: {}", e)))?
                .ok_or_else(|| SenderError::Config("no capture device available".into()))?,
        };
        tracing::info!("## capturing probes on {}", device.name);

        let mut cap = Capture::from_device(device)
            .and_then(|c| c.promisc(false).snaplen(128).timeout(10).open())
            .map_err(|e| SenderError::Config(format!("pcap open: {}", e)))?;
        cap.filter(&format!("udp and host {}", target), true)
            .map_err(|e| SenderError::Config(format!("pcap filter: {}", e)))?;

        let link = cap.get_datalink();
        let link_offset = if link == Linktype::ETHERNET {
            14
        } else if link == Linktype::NULL || link == Linktype::LOOP {
            4
        } else if link == Linktype::RAW {
            0
        } else {
            tracing::warn!("## unexpected link type {:?}; assuming ethernet", link);
            14
        };

        let handle = std::thread::Builder::new()
            .name("fathom-capture".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match cap.next_packet() {
                        Ok(pkt) => {
                            let ts = MicroTime {
                                sec: pkt.header.ts.tv_sec as u64,
                                usec: pkt.header.ts.tv_usec as u32,
                            };
                            if let Some(stamp) =
                                parse_probe_record(pkt.data, link_offset, target, probe_port, ts)
                            {
                                buffer.push(stamp);
                            }
                        }
                        Err(pcap::Error::TimeoutExpired) => continue,
                        Err(e) => {
                            tracing::warn!("## capture stopped: {}", e);
                            break;
                        }
                    }
                }
            })?;

        Ok(handle)
    }
}
