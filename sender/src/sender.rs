//! The measurement core: owns the sockets and the search state, drives
//! streams through rounds and rounds through samples.

use crate::bundle::{delay_vector, spacing_stats, ttl_of, MeasurementBundle};
use crate::capture::CaptureBuffer;
use crate::config::SenderConfig;
use crate::control::{ControlChannel, RstReply};
use crate::convergence::Convergence;
use crate::error::{Result, SenderError};
use crate::estimator::Estimator;
use crate::pacer::{self, Pacer, StreamParams};
use fathom_common::time::MicroTime;
use fathom_common::ProbeStamp;
use rand::Rng;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct Sender {
    cfg: SenderConfig,
    ctrl: ControlChannel,
    pacer: Pacer,
    conv: Convergence,

    /// Send-time stamps of the in-flight stream.
    app_probes: Vec<ProbeStamp>,
    capture: Option<Arc<CaptureBuffer>>,
    capture_running: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,

    probe_dest: SocketAddr,
    curr_stream: u32,
    runnum: u32,
}

impl Sender {
    /// Resolve the target and open both sockets. Calibrates the pacing
    /// constants when the configuration leaves them at zero.
    pub fn new(cfg: SenderConfig) -> Result<Self> {
        let probe_dest = resolve(&cfg.target, cfg.probe_port)?;
        let ctrl_dest = SocketAddr::new(probe_dest.ip(), cfg.ctrl_port);

        let ctrl = ControlChannel::connect(ctrl_dest)?;
        tracing::info!("## connected to receiver at {}", ctrl_dest);

        let (mut syscall_overhead, mut min_sleep) = (cfg.syscall_overhead, cfg.min_sleep);
        if syscall_overhead == 0 || min_sleep == 0 {
            let (measured_overhead, measured_sleep) = pacer::calibrate();
            if syscall_overhead == 0 {
                syscall_overhead = measured_overhead;
            }
            if min_sleep == 0 {
                min_sleep = measured_sleep;
            }
            tracing::info!(
                "## calibrated: syscall overhead {} us, min sleep {} us",
                syscall_overhead,
                min_sleep
            );
        }

        let pacer = Pacer::connect(probe_dest, syscall_overhead, min_sleep)?;
        let conv = Convergence::new(&cfg);

        Ok(Self {
            cfg,
            ctrl,
            pacer,
            conv,
            app_probes: Vec::new(),
            capture: None,
            capture_running: Arc::new(AtomicBool::new(true)),
            capture_thread: None,
            probe_dest,
            curr_stream: 0,
            runnum: 1,
        })
    }

    /// One RST round trip to confirm the receiver is alive and flush any
    /// half-finished measurement state on its side. Any reply counts; only
    /// silence is fatal.
    fn reset_remote(&mut self) -> Result<()> {
        let timeout = Duration::from_millis(self.cfg.ctrl_msg_timeout);
        match self.ctrl.reset_round_trip(timeout)? {
            RstReply::TimedOut => Err(SenderError::Protocol(
                "receiver did not answer the initial RST".into(),
            )),
            RstReply::Ack { .. } | RstReply::Nack => Ok(()),
        }
    }

    #[cfg(feature = "pcap")]
    fn start_capture(&mut self) {
        use std::net::IpAddr;

        let IpAddr::V4(target) = self.probe_dest.ip() else {
            tracing::warn!("## capture supports IPv4 targets only; running without it");
            return;
        };
        let buffer = CaptureBuffer::new();
        match crate::capture::start_capture(
            buffer.clone(),
            self.cfg.capture_device.clone(),
            target,
            self.cfg.probe_port,
            self.capture_running.clone(),
        ) {
            Ok(handle) => {
                self.capture = Some(buffer);
                self.capture_thread = Some(handle);
            }
            Err(e) => tracing::warn!("## capture unavailable, using app-level timing: {}", e),
        }
    }

    #[cfg(not(feature = "pcap"))]
    fn start_capture(&mut self) {}

    /// Close out one stream with the receiver and fill the bundle from
    /// both ends' observations. `Ok(false)` is a retriable miss (NACK,
    /// timeout, or an invalid measurement); the bundle is reset and the
    /// in-flight stamps are dropped either way.
    fn collect_remote(&mut self, bundle: &mut MeasurementBundle) -> Result<bool> {
        let timeout = Duration::from_millis(self.cfg.ctrl_msg_timeout);
        let (summary, remote_stamps) = match self.ctrl.reset_round_trip(timeout)? {
            RstReply::Nack => {
                tracing::info!("!! bad measurement detected at receiver");
                self.app_probes.clear();
                bundle.reset();
                return Ok(false);
            }
            RstReply::TimedOut => {
                tracing::error!(
                    "!! no RST response from remote after waiting {} milliseconds.",
                    self.cfg.ctrl_msg_timeout
                );
                self.app_probes.clear();
                bundle.reset();
                return Ok(false);
            }
            RstReply::Ack { summary, stamps } => (summary, stamps),
        };

        bundle.remote_app_mean = summary.app_mean as f64;
        bundle.remote_pcap_mean = summary.pcap_mean as f64;
        bundle.remote_ttl = summary.ttl;
        bundle.remote_nsamples = summary.nsamples;
        bundle.remote_nlost = summary.nlost;

        if !remote_stamps.is_empty() {
            bundle.delays = delay_vector(&remote_stamps, &self.app_probes);
            if remote_stamps.len() != self.app_probes.len() {
                tracing::trace!("lost probes; delay vector: {:?}", bundle.delays);
            }
        }

        let clamp = self.conv.target_spacing as f64 * 2.0;
        let app = spacing_stats(&self.app_probes, clamp, self.cfg.stream_length);
        let mut valid = app.valid;
        bundle.local_app_mean = app.mean;
        bundle.local_pcap_mean = app.mean; // stands in when capture is off
        bundle.local_nsamples = app.nsamples;
        bundle.local_nlost = app.nlost;

        let napp_probes = self.app_probes.len();
        self.app_probes.clear();

        if let Some(capture) = self.capture.clone() {
            // most likely there are fewer probes at app level than on the
            // wire, so the wire side should catch up quickly
            let wait = Duration::from_millis(self.cfg.pcap_wait_timeout);
            if !capture.wait_for_count(napp_probes, wait) {
                tracing::info!("##warning: didn't get all probes at pcap level");
            }
            let wire_stamps = capture.drain();
            let wire = spacing_stats(&wire_stamps, clamp, self.cfg.stream_length);
            valid = wire.valid;
            match ttl_of(&wire_stamps) {
                Some(ttl) => bundle.local_ttl = ttl as u32,
                None => valid = false,
            }
            // wire-level stats shadow the app-level counters from here on
            bundle.local_pcap_mean = wire.mean;
            bundle.local_nsamples = wire.nsamples;
            bundle.local_nlost = wire.nlost;
        }

        if !valid {
            bundle.reset();
            return Ok(false);
        }
        Ok(true)
    }

    /// Draw from the exponential inter-sample sleep.
    fn sleep_exponentially(&self) {
        let u: f64 = rand::thread_rng().gen();
        let ms = (-(self.cfg.inter_stream_spacing as f64 / 1000.0) * (1.0 - u).ln()) as u64;
        std::thread::sleep(Duration::from_millis(ms));
    }
}

impl Estimator for Sender {
    /// Prepare capture, confirm the receiver is alive, and announce the
    /// spacing ceiling for the run.
    fn setup_run(&mut self) -> Result<()> {
        tracing::debug!("## probing {}", self.probe_dest);
        self.start_capture();
        self.reset_remote()?;
        tracing::info!("## setting max_space to be {}", self.conv.max_space());
        self.conv.curr_estimation = 0.0;
        Ok(())
    }

    /// Collect up to `nstreams` valid bundles, spending at most `nstreams`
    /// consecutive failed attempts. `Ok(false)` means the receiver never
    /// produced a usable measurement.
    fn do_round(&mut self, list: &mut Vec<MeasurementBundle>) -> Result<bool> {
        let mut bundle = MeasurementBundle::default();
        let mut attempts = self.cfg.nstreams;
        let mut streamnum = 1;

        while streamnum <= self.cfg.nstreams && attempts > 0 {
            bundle.reset();
            bundle.start = MicroTime::now();
            self.curr_stream += 1;
            self.app_probes.clear();

            let params = StreamParams {
                stream: self.curr_stream,
                length: self.cfg.stream_length,
                pkt_size: self.conv.curr_pkt_size,
                spacing: self.conv.target_spacing,
            };
            if let Err(e) = self.pacer.send_stream(&params, &mut self.app_probes) {
                tracing::warn!("!! error sending probe: {}", e);
                attempts -= 1;
                continue;
            }
            bundle.end = MicroTime::now();

            // let the tail of the stream land before asking for the verdict
            std::thread::sleep(Duration::from_millis(2));

            if !self.collect_remote(&mut bundle)? {
                attempts -= 1;
                continue;
            }

            if bundle.remote_nlost > 1 {
                // the loss itself is the signal; keep the bundle
                tracing::debug!("## pkts lost --- backing off: {}", bundle.remote_nlost);
            } else if bundle.remote_nsamples < self.cfg.stream_length / 2 {
                tracing::debug!(
                    "## not enough samples from receiver: {}",
                    bundle.remote_nsamples
                );
                attempts -= 1;
                continue;
            }

            list.push(bundle.clone());
            streamnum += 1;
            attempts = self.cfg.nstreams;
        }

        Ok(attempts != 0)
    }

    fn process_round(&mut self, list: &mut Vec<MeasurementBundle>) -> Result<bool> {
        self.conv.process_round(list)
    }

    fn reset_round(&mut self) {
        self.conv.reset_round();
    }

    fn estimation(&self) -> f64 {
        self.conv.curr_estimation
    }

    /// Sample until doomsday: one result line per sample on stdout.
    fn run(&mut self) -> Result<()> {
        let mut list: Vec<MeasurementBundle> = Vec::new();
        loop {
            let tvbegin = MicroTime::now();
            list.clear();
            self.reset_round();
            let mut done = false;

            tracing::info!("## starting sample {}", self.runnum);
            tracing::debug!(
                "## sample {}, initial spacing: {}",
                self.runnum,
                self.conv.target_spacing
            );

            while !done && self.conv.local_crawl > 0 {
                if !self.do_round(&mut list)? {
                    return Err(SenderError::ReceiverUnusable);
                }
                done = self.process_round(&mut list)?;
                if !done {
                    self.sleep_exponentially();
                }
            }

            let tvend = MicroTime::now();
            println!(
                "{}",
                format_result_line(self.runnum, tvbegin, tvend, self.estimation())
            );
            tracing::debug!(
                "## sample {}: generated {} probe bits",
                self.runnum,
                self.conv.traffic_generated
            );

            self.runnum += 1;
            self.conv.curr_estimation = 0.0;
            self.sleep_exponentially();
        }
    }

    fn cleanup(&mut self) {
        self.capture_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        tracing::debug!("## sender cleanup complete");
    }
}

/// `<runnum> <begin> <end> <estimate-kbit/s>` with microseconds zero-padded
/// to six digits and the estimate printed without a fraction.
pub fn format_result_line(runnum: u32, begin: MicroTime, end: MicroTime, bits_per_sec: f64) -> String {
    format!("{} {} {} {:.0}", runnum, begin, end, bits_per_sec / 1000.0)
}

fn resolve(target: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (target, port)
        .to_socket_addrs()
        .map_err(|e| SenderError::Config(format!("cannot resolve '{}': {}", target, e)))?;
    addrs
        .find(|a| a.is_ipv4())
        .ok_or_else(|| SenderError::Config(format!("no IPv4 address for '{}'", target)))
}
