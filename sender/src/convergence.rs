//! The convergence engine: decides after each round whether the probe rate
//! found queuing (tighten the spacing) or not (the estimate is final).
//!
//! The search is a midpoint bisection on the inter-probe spacing between
//! what the sender asked for and what the receiver observed, with a
//! degenerate-tie nudge, a per-sample retry budget, and packet-size
//! halving when the required spacing outgrows what a stream can carry.

use crate::bundle::{coalesce, path_len_stable, MeasurementBundle};
use crate::config::SenderConfig;
use crate::error::{Result, SenderError};

pub struct Convergence {
    /// Intended inter-probe gap for the next stream, microseconds.
    pub target_spacing: u32,
    /// Probe packet size for the next stream, bytes.
    pub curr_pkt_size: u32,
    /// Final estimate of the sample in bits/s; 0 until converged.
    pub curr_estimation: f64,
    /// Probe bits emitted this sample.
    pub traffic_generated: u64,
    /// Remaining rounds before the sample falls back to the last-measured
    /// rate.
    pub local_crawl: i32,

    saved_pkt_size: u32,
    min_pkt_size: u32,
    /// Fastest (smallest) locally achieved spacing at the full packet size.
    fastest_local: u32,
    /// Ceiling on target spacing given the smallest packet and the
    /// resolution.
    max_space: u32,
    min_space: u32,
    resolution: f64,
    threshold: f64,
    retry_limit: i32,
}

impl Convergence {
    pub fn new(cfg: &SenderConfig) -> Self {
        let resolution_bound = (cfg.min_pkt_size as f64 * 8.0 / cfg.resolution) as u32;
        let max_space = resolution_bound.max(cfg.max_space);
        Self {
            target_spacing: cfg.min_space,
            curr_pkt_size: cfg.pkt_size,
            curr_estimation: 0.0,
            traffic_generated: 0,
            local_crawl: cfg.retry_limit,
            saved_pkt_size: cfg.pkt_size,
            min_pkt_size: cfg.min_pkt_size,
            fastest_local: max_space,
            max_space,
            min_space: cfg.min_space,
            resolution: cfg.resolution,
            threshold: cfg.threshold,
            retry_limit: cfg.retry_limit,
        }
    }

    pub fn max_space(&self) -> u32 {
        self.max_space
    }

    /// Start a fresh sample: smallest spacing, full packet size, full
    /// retry budget.
    pub fn reset_round(&mut self) {
        self.target_spacing = self.min_space;
        self.curr_pkt_size = self.saved_pkt_size;
        self.local_crawl = self.retry_limit;
        self.traffic_generated = 0;
    }

    /// Evaluate one round and either adjust the target spacing or finalize
    /// the estimate. Returns whether the sample is done; consumes the
    /// round's bundle list either way.
    pub fn process_round(&mut self, list: &mut Vec<MeasurementBundle>) -> Result<bool> {
        if !path_len_stable(list) {
            return Err(SenderError::PathChanged);
        }

        let mb = coalesce(list);
        self.traffic_generated += mb.local_nsamples as u64 * self.curr_pkt_size as u64 * 8;

        if !self.spacing_consistent(list) {
            // local_forgiveness hook: diagnostic only, no retry budget yet
            tracing::debug!(
                "## inconsistent local spacing (asked {} got {:.1})",
                self.target_spacing,
                mb.local_pcap_mean
            );
        }

        // Range of compression or expansion that keeps the rate within one
        // resolution step of what we actually sent, floored at 1 us (which
        // only matters at rather fast probe rates).
        let bits = self.curr_pkt_size as f64 * 8.0;
        let curr_rate = bits / mb.local_pcap_mean * 1e6;
        let resol_spc = bits / (curr_rate - self.resolution) * 1e6 - mb.local_pcap_mean;
        let maxdiff = resol_spc.max(1.0);
        let mut compexp = (mb.remote_pcap_mean - mb.local_pcap_mean).abs() > maxdiff;

        // packet loss forces a lower rate no matter what the spacings say
        compexp = compexp || mb.remote_nlost > 1;

        if !compexp && self.curr_pkt_size == self.saved_pkt_size {
            self.fastest_local = self.fastest_local.min(mb.local_pcap_mean as u32);
        }

        tracing::debug!(
            "## local spacing: {:.1} remote spacing: {:.1} compexp: {}",
            mb.local_pcap_mean,
            mb.remote_pcap_mean,
            compexp
        );
        if mb.local_ttl != 0 && mb.remote_ttl != 0 {
            tracing::debug!(
                "## path length: {} hops",
                mb.local_ttl as i64 - mb.remote_ttl as i64
            );
        }

        let mut done = false;
        if compexp {
            // Even though the local spacing was consistent, it may not be
            // what we targeted; bisect between what we sent and what
            // arrived.
            if self.target_spacing as f64 == mb.remote_pcap_mean {
                self.target_spacing += 2;
                self.local_crawl -= 1;
            } else {
                let diff = (mb.remote_pcap_mean - mb.local_pcap_mean).abs();
                self.target_spacing = (mb.local_pcap_mean + diff / 2.0) as u32;
            }
            tracing::trace!("new target: {}", self.target_spacing);

            if self.target_spacing >= self.max_space {
                if self.curr_pkt_size == self.min_pkt_size {
                    tracing::info!("## avbw too low to accurately measure.");
                    done = true;
                    self.curr_estimation = 0.0;
                }
                while self.target_spacing > self.max_space {
                    self.curr_pkt_size = (self.curr_pkt_size / 2).max(self.min_pkt_size);
                    tracing::debug!(
                        "## rate too high with current packet size.  cut packet size to: {}",
                        self.curr_pkt_size
                    );
                    self.target_spacing /= 2;
                }
            }
        } else {
            self.curr_estimation = bits / (mb.local_pcap_mean / 1e6);
            done = true;
            tracing::debug!(
                "## done. setting current estimate to {:.1}",
                self.curr_estimation / 1000.0
            );
        }

        list.clear();
        if self.local_crawl <= 0 {
            // retry budget exhausted: fall back to the last-measured rate
            self.curr_estimation = curr_rate;
            done = true;
        }

        Ok(done)
    }

    /// Whether every stream of the round achieved the spacing we asked
    /// for, within the configured tolerance.
    fn spacing_consistent(&self, list: &[MeasurementBundle]) -> bool {
        list.iter().all(|mb| {
            (mb.local_pcap_mean - self.target_spacing as f64).abs()
                <= f64::max(2.0, self.threshold * self.target_spacing as f64)
        })
    }
}
