//! # `lunacap`
//!
//! A decoder for the raw capture stream produced by LUNA-class USB 2.0
//! protocol analyzers.
//!
//! The analyzer delivers timestamped on-wire packets as a sequence of
//! length-prefixed frames. This crate reconstructs three protocol
//! layers from that stream — packets, transactions and transfers — and
//! assembles them into a [`Capture`]: flat, memory-mapped arrays of
//! fixed-width records cross-referenced by index, plus per-endpoint
//! traffic indices for efficient traversal.
//!
//! The decoder is fault-absorbing: no input produces an error. Stray
//! packets, aborted transactions and NAKed retries all end up in the
//! capture, visible only as records marked incomplete. Errors are
//! reserved for I/O and mapping failures while building the capture.
//!
//! Usage is simple:
//! ```
//! use lunacap::{read_capture, DecoderOptions};
//!
//! // or a std::fs::File, or anything else that implements std::io::Read
//! let stream: &[u8] = &[
//!     // ...
//! ];
//! let capture = read_capture(stream, DecoderOptions::default())?;
//! assert_eq!(capture.num_packets(), 0);
//! # Ok::<(), lunacap::CaptureError>(())
//! ```
#![deny(rustdoc::broken_intra_doc_links)]

pub mod capture;
pub mod decoder;
pub mod reader;
pub mod stream;
pub mod usb;

pub use capture::{
    Capture, Endpoint, EndpointTraffic, Packet, Transaction, Transfer, TransferIndexEntry,
};
pub use decoder::{read_capture, Decoder, DecoderOptions};
pub use reader::{FrameReader, MAX_FRAME_SIZE};

/// Set of errors that can occur while building a capture.
///
/// Protocol violations in the input are absorbed by the decoder and
/// never surface here; a capture fails only when its resources do.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The input byte source failed with a real I/O error (truncation
    /// is not one: it terminates the stream cleanly).
    #[error("failed to read capture stream: {0}")]
    Input(#[from] std::io::Error),

    /// An output stream could not be created, written or mapped.
    #[error("stream {name}: {source}")]
    Stream {
        /// Advisory name of the stream involved.
        name: String,
        source: std::io::Error,
    },
}
