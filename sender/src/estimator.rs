//! The estimator capability set.
//!
//! A measurement algorithm is a setup/round/teardown state machine; keeping
//! the surface behind a trait keeps the run loop independent of the probing
//! strategy. The receiver side of a pair implements a much narrower set and
//! lives in its own daemon, so only the sender capabilities appear here.

use crate::bundle::MeasurementBundle;
use crate::error::Result;

pub trait Estimator {
    /// One-time preparation after sockets exist: capture, receiver
    /// liveness, search bounds.
    fn setup_run(&mut self) -> Result<()>;

    /// Sample indefinitely, reporting one estimate per sample. Only
    /// returns on a fatal error.
    fn run(&mut self) -> Result<()>;

    /// Release auxiliary resources; sockets close on drop.
    fn cleanup(&mut self);

    /// Collect one round of valid measurement bundles into `list`.
    fn do_round(&mut self, list: &mut Vec<MeasurementBundle>) -> Result<bool>;

    /// Consume a round and decide whether the sample has converged.
    fn process_round(&mut self, list: &mut Vec<MeasurementBundle>) -> Result<bool>;

    /// Rewind the search state for a fresh sample.
    fn reset_round(&mut self);

    /// The current estimate in bits/s; 0 before convergence.
    fn estimation(&self) -> f64;
}
