//! KATCP (Karoo Array Telescope Control Protocol) client.
//!
//! KATCP is the line-based text protocol spoken by CASPER FPGA control
//! servers (tcpborphserver and friends) on TCP port 7147. Each line is one
//! message: a request (`?name arg ...`), a reply (`!name ok ...`), or an
//! inform (`#name arg ...`). Arguments are whitespace-separated and
//! backslash-escaped, so binary payloads (register contents, bitstream
//! chunks) travel inline.
//!
//! This crate provides the wire-format layer ([`Message`], escaping) and a
//! blocking request/reply client ([`Client`]) suitable for synchronous
//! instrument control. Device-level semantics (register maps, RFDC bring-up)
//! live with the consumer.

mod client;
mod message;

pub use client::{Client, Response, DEFAULT_PORT, DEFAULT_TIMEOUT};
pub use message::{escape_argument, unescape_argument, Message, MessageKind};

use thiserror::Error;

/// Errors produced by KATCP parsing and transport.
#[derive(Error, Debug)]
pub enum KatcpError {
    /// Socket-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No complete reply arrived within the configured timeout.
    #[error("timeout waiting for reply to ?{0}")]
    Timeout(String),

    /// The server replied with a status other than `ok`.
    #[error("request ?{name} failed with status {status}: {message}")]
    RequestFailed {
        /// Request name as sent.
        name: String,
        /// Reply status word (`fail` or `invalid`).
        status: String,
        /// Server-supplied diagnostic, if any.
        message: String,
    },

    /// A line on the wire did not parse as a KATCP message.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for KATCP operations.
pub type KatcpResult<T> = Result<T, KatcpError>;
