//! Error types for the sender.
//!
//! Fatal conditions are errors; retriable conditions (receiver NACK,
//! control timeout, insufficient samples) are ordinary `false` outcomes
//! consumed by the round loop, which retries within its attempt budget.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SenderError {
    /// Socket or I/O failure on any surface (setup or control transport).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed data on the control channel.
    #[error("protocol error: {0}")]
    Proto(#[from] fathom_common::ProtoError),

    /// The receiver violated the control protocol (wrong code, bad seq echo).
    #[error("control protocol violation: {0}")]
    Protocol(String),

    /// Invalid configuration, caught before setup.
    #[error("configuration error: {0}")]
    Config(String),

    /// TTL delta between the two ends changed between streams of one round.
    #[error("path length changed during measurement")]
    PathChanged,

    /// The per-round attempt budget ran out without a usable measurement.
    #[error("persistent error collecting measurements from receiver")]
    ReceiverUnusable,
}

pub type Result<T> = std::result::Result<T, SenderError>;
