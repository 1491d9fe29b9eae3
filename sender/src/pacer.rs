//! Paced probe-stream transmission.
//!
//! One stream is `stream_length` equal-size UDP datagrams emitted one every
//! `spacing` microseconds. OS sleep granularity is far too coarse for that,
//! so each gap is a coarse sleep that deliberately undershoots by
//! `min_sleep`, followed by a busy spin until the clock-read overhead says
//! the target is now. The next target is based on the actual send time, not
//! the ideal one: the pacer drifts with the system instead of accumulating
//! a backlog.

use crate::error::Result;
use fathom_common::time::MicroTime;
use fathom_common::{write_probe_header, ProbeStamp, IPV4_HEADER_LEN, UDP_HEADER_LEN};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// Shape of one probe stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub stream: u32,
    /// Probes in the stream.
    pub length: u32,
    /// Packet size in bytes, inclusive of IP and UDP headers.
    pub pkt_size: u32,
    /// Target inter-probe gap in microseconds.
    pub spacing: u32,
}

pub struct Pacer {
    socket: UdpSocket,
    /// Cost of one clock read, microseconds.
    pub syscall_overhead: u32,
    /// Shortest sleep the platform delivers, microseconds.
    pub min_sleep: u32,
}

impl Pacer {
    /// Bind an ephemeral UDP socket and connect it to the receiver, pinning
    /// the destination for the whole run.
    pub fn connect(dest: SocketAddr, syscall_overhead: u32, min_sleep: u32) -> Result<Self> {
        let domain = if dest.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        // keep the kernel from ever blocking a paced send on buffer space
        socket.set_send_buffer_size(1 << 20)?;
        let any: SocketAddr = if dest.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        socket.bind(&any.into())?;
        socket.connect(&dest.into())?;

        Ok(Self {
            socket: socket.into(),
            syscall_overhead,
            min_sleep,
        })
    }

    /// Transmit one stream, appending a send-time stamp per probe to
    /// `stamps`. A send failure aborts the stream with an error the round
    /// loop counts against its attempt budget; falling behind the target
    /// spacing aborts it silently and the partial stream is still
    /// evaluated.
    pub fn send_stream(&self, params: &StreamParams, stamps: &mut Vec<ProbeStamp>) -> Result<()> {
        let payload_len = params.pkt_size as usize - IPV4_HEADER_LEN - UDP_HEADER_LEN;
        let mut buf = vec![0u8; payload_len];
        let spacing = Duration::from_micros(params.spacing as u64);
        let spin_gate = Duration::from_micros((self.syscall_overhead / 2) as u64);

        write_probe_header(&mut buf, params.stream, 0);
        self.socket.send(&buf)?;
        let mut sent = Instant::now();
        stamps.push(ProbeStamp {
            stream: params.stream,
            sequence: 0,
            ts: MicroTime::now(),
            ttl: 0,
        });
        let mut target = sent + spacing;

        for sequence in 1..params.length {
            // coarse sleep, undershooting so the spin takes over
            let remain = target.saturating_duration_since(Instant::now());
            let sleep_for = remain.saturating_sub(Duration::from_micros(self.min_sleep as u64));
            if !sleep_for.is_zero() {
                std::thread::sleep(sleep_for);
            }

            // fine wait
            while target.saturating_duration_since(Instant::now()) >= spin_gate {
                std::hint::spin_loop();
            }

            write_probe_header(&mut buf, params.stream, sequence);
            self.socket.send(&buf)?;
            sent = Instant::now();
            stamps.push(ProbeStamp {
                stream: params.stream,
                sequence,
                ts: MicroTime::now(),
                ttl: 0,
            });

            let overshoot = sent.saturating_duration_since(target);
            target = sent + spacing;
            if overshoot > spacing {
                tracing::warn!("!! probe stream too fast to generate.  aborting");
                break;
            }
        }

        Ok(())
    }
}

/// Measure the platform's clock-read overhead and shortest deliverable
/// sleep, both in microseconds. Run once at startup when the configured
/// values are zero.
pub fn calibrate() -> (u32, u32) {
    const CLOCK_READS: u32 = 1_000;
    let begin = Instant::now();
    for _ in 0..CLOCK_READS {
        std::hint::black_box(Instant::now());
    }
    let per_read = begin.elapsed().as_micros() as u32 / CLOCK_READS;

    const SLEEPS: u32 = 20;
    let begin = Instant::now();
    for _ in 0..SLEEPS {
        std::thread::sleep(Duration::from_micros(1));
    }
    let per_sleep = (begin.elapsed().as_micros() as u32) / SLEEPS;

    (per_read.max(1), per_sleep.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_common::parse_probe_header;

    fn loopback_pair() -> (Pacer, UdpSocket) {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = sink.local_addr().unwrap();
        let pacer = Pacer::connect(dest, 2, 1_500).unwrap();
        (pacer, sink)
    }

    #[test]
    fn stream_is_ordered_and_complete() {
        let (pacer, _sink) = loopback_pair();
        let params = StreamParams {
            stream: 4,
            length: 10,
            pkt_size: 128,
            spacing: 5_000,
        };
        let mut stamps = Vec::new();
        pacer.send_stream(&params, &mut stamps).unwrap();

        assert_eq!(stamps.len(), 10);
        for (i, s) in stamps.iter().enumerate() {
            assert_eq!(s.stream, 4);
            assert_eq!(s.sequence, i as u32);
        }
        assert!(stamps.windows(2).all(|p| p[0].ts <= p[1].ts));
    }

    #[test]
    fn datagrams_carry_the_probe_header() {
        let (pacer, sink) = loopback_pair();
        sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let params = StreamParams {
            stream: 7,
            length: 3,
            pkt_size: 100,
            spacing: 5_000,
        };
        let mut stamps = Vec::new();
        pacer.send_stream(&params, &mut stamps).unwrap();

        let expected_payload = 100 - IPV4_HEADER_LEN - UDP_HEADER_LEN;
        let mut buf = [0u8; 2048];
        for sequence in 0..3u32 {
            let n = sink.recv(&mut buf).unwrap();
            assert_eq!(n, expected_payload);
            assert_eq!(parse_probe_header(&buf[..n]), Some((7, sequence)));
        }
    }

    #[test]
    fn calibration_reports_sane_values() {
        let (overhead, min_sleep) = calibrate();
        assert!(overhead >= 1);
        assert!(min_sleep >= 1);
        // a microsecond sleep cannot take a full second on any platform we run on
        assert!(min_sleep < 1_000_000);
    }
}
