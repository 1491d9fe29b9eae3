//! Per-stream measurement records and the arithmetic over them.

use fathom_common::ProbeStamp;
use fathom_common::time::MicroTime;
use std::time::Duration;

/// Everything observed about one probe stream, from both ends.
///
/// Populated in stages: the round loop sets the wall-clock bounds, the
/// control exchange fills the remote fields and the delay vector, and the
/// local spacing computation fills the local fields. Read-only once it
/// reaches the convergence engine.
#[derive(Debug, Clone, Default)]
pub struct MeasurementBundle {
    pub start: MicroTime,
    pub end: MicroTime,

    /// Mean inter-probe spacing in microseconds, sender side, application
    /// layer and capture layer.
    pub local_app_mean: f64,
    pub local_pcap_mean: f64,

    /// Same, receiver side.
    pub remote_app_mean: f64,
    pub remote_pcap_mean: f64,

    /// IP TTL of probes seen on the wire at each end; their difference is
    /// the path length in hops.
    pub local_ttl: u32,
    pub remote_ttl: u32,

    pub local_nsamples: u32,
    pub local_nlost: u32,
    pub remote_nsamples: u32,
    pub remote_nlost: u32,

    /// Per-probe one-way delays in send order; `None` marks a lost probe.
    pub delays: Vec<Option<Duration>>,
}

impl MeasurementBundle {
    /// Reset before reuse; a failed round discards its contents this way.
    pub fn reset(&mut self) {
        let delays = std::mem::take(&mut self.delays);
        *self = Self::default();
        self.delays = delays;
        self.delays.clear();
    }
}

/// Spacing statistics over one sequence of probe stamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpacingStats {
    /// Mean inter-probe gap in microseconds over the unclamped pairs.
    pub mean: f64,
    pub nsamples: u32,
    pub nlost: u32,
    /// At least half the stream was observed.
    pub valid: bool,
}

/// Mean spacing over adjacent stamp pairs. A gap wider than `clamp_us`
/// means at least one probe went missing there: it counts as loss and is
/// excluded from the mean. `nsamples + nlost` always equals
/// `stream_length`.
pub fn spacing_stats(stamps: &[ProbeStamp], clamp_us: f64, stream_length: u32) -> SpacingStats {
    let seen = stamps.len() as u32;
    if seen < 2 {
        return SpacingStats {
            mean: 0.0,
            nsamples: seen,
            nlost: stream_length.saturating_sub(seen),
            valid: false,
        };
    }

    let mut sum = 0.0;
    let mut ngood = 0u32;
    let mut nlost = 0u32;
    for pair in stamps.windows(2) {
        let gap = pair[1].ts.as_micros().saturating_sub(pair[0].ts.as_micros()) as f64;
        if gap > clamp_us {
            nlost += 1;
        } else {
            sum += gap;
            ngood += 1;
        }
    }

    let nsamples = ngood + 1;
    nlost += stream_length.saturating_sub(seen);
    SpacingStats {
        mean: if ngood > 0 { sum / ngood as f64 } else { 0.0 },
        nsamples,
        nlost,
        valid: nsamples >= stream_length / 2,
    }
}

/// Reconstruct per-probe one-way delays by pairing receiver stamps with
/// local send stamps by sequence number. Both inputs are strictly ordered
/// by sequence and reordering is not assumed; every local probe the
/// receiver never reported becomes a `None`. A negative delta means the
/// clocks are not synchronized and is also recorded as `None` rather than
/// a bogus delay.
pub fn delay_vector(remote: &[ProbeStamp], local: &[ProbeStamp]) -> Vec<Option<Duration>> {
    let mut delays = Vec::with_capacity(local.len());
    let mut j = 0;

    for r in remote {
        while j < local.len() && local[j].sequence != r.sequence {
            delays.push(None);
            j += 1;
        }
        if j >= local.len() {
            break;
        }
        delays.push(r.ts.checked_sub(&local[j].ts));
        j += 1;
    }

    // probes dropped at the tail of the stream
    while j < local.len() {
        delays.push(None);
        j += 1;
    }

    delays
}

/// Fold a round's bundles into one: wall-clock bounds from the ends of the
/// list, arithmetic mean of the spacings, sums of the counters. The delay
/// vector of the final bundle is the one retained.
pub fn coalesce(list: &[MeasurementBundle]) -> MeasurementBundle {
    debug_assert!(!list.is_empty());
    let mut out = list[0].clone();
    for mb in &list[1..] {
        out.local_app_mean += mb.local_app_mean;
        out.local_pcap_mean += mb.local_pcap_mean;
        out.remote_app_mean += mb.remote_app_mean;
        out.remote_pcap_mean += mb.remote_pcap_mean;
        out.end = mb.end;

        out.local_nsamples += mb.local_nsamples;
        out.local_nlost += mb.local_nlost;
        out.remote_nsamples += mb.remote_nsamples;
        out.remote_nlost += mb.remote_nlost;
    }

    let n = list.len() as f64;
    out.local_app_mean /= n;
    out.local_pcap_mean /= n;
    out.remote_app_mean /= n;
    out.remote_pcap_mean /= n;
    out.delays = list[list.len() - 1].delays.clone();
    out
}

/// The TTL delta between the two ends must not move between streams of one
/// round; if it does, the route changed under the measurement.
pub fn path_len_stable(list: &[MeasurementBundle]) -> bool {
    list.windows(2).all(|pair| {
        pair[0].local_ttl as i64 - pair[0].remote_ttl as i64
            == pair[1].local_ttl as i64 - pair[1].remote_ttl as i64
    })
}

/// TTL shared by every stamp of a capture set, or `None` when the set is
/// empty or inconsistent (which invalidates the measurement).
pub fn ttl_of(stamps: &[ProbeStamp]) -> Option<u8> {
    let first = stamps.first()?.ttl;
    stamps[1..]
        .iter()
        .all(|s| s.ttl == first)
        .then_some(first)
}
