//! Integration tests for the sender against an in-process fake receiver.
//!
//! The fake receiver is a TCP listener thread speaking the control
//! protocol from a reply script, plus a bound UDP socket absorbing the
//! probe streams.

use fathom_common::time::MicroTime;
use fathom_common::{
    encode_stamps, CtrlCode, CtrlHeader, ProbeStamp, RstSummary, CTRL_HEADER_LEN, RST_SUMMARY_LEN,
};
use fathom_sender::config::SenderConfig;
use fathom_sender::control::{ControlChannel, RstReply};
use fathom_sender::{Estimator, Sender};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One scripted reply to a RST. The script is consumed in order and the
/// last entry repeats forever.
#[derive(Clone)]
enum Reply {
    Ack {
        summary: RstSummary,
        /// Report stamps for the even sequences only, with a far-future
        /// timestamp so every reconstructed delay is positive.
        even_stamps: bool,
    },
    Nack,
    Silent,
}

struct FakeReceiver {
    ctrl_port: u16,
    probe_port: u16,
    /// Request sequence numbers seen, in order.
    seqs: Arc<Mutex<Vec<u32>>>,
    _probe_sink: UdpSocket,
}

fn spawn_fake(replies: Vec<Reply>, stream_length: u32) -> FakeReceiver {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let ctrl_port = listener.local_addr().unwrap().port();
    let probe_sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    let probe_port = probe_sink.local_addr().unwrap().port();

    let seqs = Arc::new(Mutex::new(Vec::new()));
    let seen = seqs.clone();

    thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let mut next_reply = 0usize;
        loop {
            let mut hdr_buf = [0u8; CTRL_HEADER_LEN];
            if stream.read_exact(&mut hdr_buf).is_err() {
                return; // sender went away
            }
            let request = CtrlHeader::decode(&hdr_buf).unwrap();
            assert_eq!(request.code, CtrlCode::Rst);
            seen.lock().push(request.seq);

            let reply = replies[next_reply.min(replies.len() - 1)].clone();
            next_reply += 1;
            match reply {
                Reply::Silent => continue,
                Reply::Nack => {
                    let header = CtrlHeader {
                        code: CtrlCode::RstNack,
                        len: 0,
                        ps_vec_len: 0,
                        seq: request.seq,
                        reason: 0,
                    };
                    if stream.write_all(&header.encode()).is_err() {
                        return;
                    }
                }
                Reply::Ack {
                    summary,
                    even_stamps,
                } => {
                    let stamps: Vec<ProbeStamp> = if even_stamps {
                        let base = MicroTime::now().as_micros() + 10_000_000;
                        (0..stream_length)
                            .filter(|sequence| sequence % 2 == 0)
                            .map(|sequence| ProbeStamp {
                                stream: 0,
                                sequence,
                                ts: MicroTime::from_micros(base + sequence as u64 * 100),
                                ttl: 54,
                            })
                            .collect()
                    } else {
                        Vec::new()
                    };
                    let stamp_bytes = encode_stamps(&stamps).unwrap();
                    let header = CtrlHeader {
                        code: CtrlCode::RstAck,
                        len: RST_SUMMARY_LEN as u32,
                        ps_vec_len: stamp_bytes.len() as u32,
                        seq: request.seq,
                        reason: 0,
                    };
                    let mut out = Vec::with_capacity(CTRL_HEADER_LEN + RST_SUMMARY_LEN);
                    out.extend_from_slice(&header.encode());
                    out.extend_from_slice(&summary.encode());
                    out.extend_from_slice(&stamp_bytes);
                    if stream.write_all(&out).is_err() {
                        return;
                    }
                }
            }
        }
    });

    FakeReceiver {
        ctrl_port,
        probe_port,
        seqs,
        _probe_sink: probe_sink,
    }
}

fn ctrl_addr(fake: &FakeReceiver) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], fake.ctrl_port))
}

fn quiet_summary() -> RstSummary {
    RstSummary {
        app_mean: 20_100,
        pcap_mean: 20_050,
        ttl: 54,
        nsamples: 10,
        nlost: 0,
    }
}

/// Test configuration tuned for loopback: wide spacings so scheduler
/// jitter cannot push gaps past the loss clamp.
fn test_config(fake: &FakeReceiver) -> SenderConfig {
    SenderConfig {
        target: "127.0.0.1".into(),
        probe_port: fake.probe_port,
        ctrl_port: fake.ctrl_port,
        pkt_size: 128,
        min_pkt_size: 64,
        stream_length: 10,
        nstreams: 1,
        min_space: 20_000,
        max_space: 50_000,
        syscall_overhead: 2,
        min_sleep: 1_500,
        ctrl_msg_timeout: 3_000,
        ..Default::default()
    }
}

#[test]
fn control_ack_round_trip_and_seq_advance() {
    let summary = quiet_summary();
    let fake = spawn_fake(
        vec![Reply::Ack {
            summary,
            even_stamps: false,
        }],
        10,
    );
    let mut ctrl = ControlChannel::connect(ctrl_addr(&fake)).unwrap();

    match ctrl.reset_round_trip(Duration::from_secs(5)).unwrap() {
        RstReply::Ack {
            summary: got,
            stamps,
        } => {
            assert_eq!(got, summary);
            assert!(stamps.is_empty());
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    // the sequence number advances only after a successful ACK
    ctrl.reset_round_trip(Duration::from_secs(5)).unwrap();
    assert_eq!(*fake.seqs.lock(), vec![0, 1]);
}

#[test]
fn control_nack_does_not_advance_seq() {
    let fake = spawn_fake(vec![Reply::Nack], 10);
    let mut ctrl = ControlChannel::connect(ctrl_addr(&fake)).unwrap();

    assert!(matches!(
        ctrl.reset_round_trip(Duration::from_secs(5)).unwrap(),
        RstReply::Nack
    ));
    assert!(matches!(
        ctrl.reset_round_trip(Duration::from_secs(5)).unwrap(),
        RstReply::Nack
    ));
    assert_eq!(*fake.seqs.lock(), vec![0, 0]);
}

#[test]
fn control_times_out_on_a_silent_receiver() {
    let fake = spawn_fake(vec![Reply::Silent], 10);
    let mut ctrl = ControlChannel::connect(ctrl_addr(&fake)).unwrap();

    let reply = ctrl.reset_round_trip(Duration::from_millis(1_200)).unwrap();
    assert!(matches!(reply, RstReply::TimedOut));
}

#[test]
fn one_round_fills_a_bundle_and_backs_off() {
    // liveness RST first, then a round whose arrival spacing (100 ms) is
    // far wider than anything the sender can have produced at a 20 ms
    // target: guaranteed expansion
    let expanded = RstSummary {
        app_mean: 100_000,
        pcap_mean: 100_000,
        ttl: 54,
        nsamples: 10,
        nlost: 0,
    };
    let fake = spawn_fake(
        vec![
            Reply::Ack {
                summary: quiet_summary(),
                even_stamps: false,
            },
            Reply::Ack {
                summary: expanded,
                even_stamps: true,
            },
        ],
        10,
    );

    let mut sender = Sender::new(test_config(&fake)).unwrap();
    sender.setup_run().unwrap();

    let mut list = Vec::new();
    assert!(sender.do_round(&mut list).unwrap());
    assert_eq!(list.len(), 1);

    let bundle = &list[0];
    assert_eq!(bundle.remote_pcap_mean, 100_000.0);
    assert_eq!(bundle.remote_ttl, 54);
    assert_eq!(bundle.remote_nsamples, 10);
    assert!(bundle.start <= bundle.end);
    assert_eq!(bundle.local_nsamples + bundle.local_nlost, 10);
    assert!(bundle.local_app_mean > 0.0);

    // the fake reported the even sequences only
    assert_eq!(bundle.delays.len(), 10);
    for (i, delay) in bundle.delays.iter().enumerate() {
        if i % 2 == 0 {
            assert!(delay.is_some(), "expected a delay at position {}", i);
        } else {
            assert!(delay.is_none(), "expected loss at position {}", i);
        }
    }

    // expansion: the sample is not done and no estimate exists yet
    assert!(!sender.process_round(&mut list).unwrap());
    assert!(list.is_empty());
    assert_eq!(sender.estimation(), 0.0);

    sender.cleanup();
}

#[test]
fn persistent_nack_exhausts_the_round_budget() {
    let fake = spawn_fake(
        vec![
            Reply::Ack {
                summary: quiet_summary(),
                even_stamps: false,
            },
            Reply::Nack,
        ],
        10,
    );

    let mut cfg = test_config(&fake);
    cfg.nstreams = 2;
    let mut sender = Sender::new(cfg).unwrap();
    sender.setup_run().unwrap();

    let mut list = Vec::new();
    assert!(!sender.do_round(&mut list).unwrap());
    assert!(list.is_empty());

    // liveness ACK bumped the seq to 1; both NACKed attempts reuse it
    assert_eq!(*fake.seqs.lock(), vec![0, 1, 1]);

    sender.cleanup();
}
