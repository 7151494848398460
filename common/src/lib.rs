//! Gatelink Common Library
//!
//! This crate provides the messaging core shared by the Gatelink client and
//! the filtering service. It includes:
//!
//! - A 4-byte-aligned wire codec for payload values
//! - Ownership-tracked port capability rights (receive, send, send-once)
//! - The message envelope model: header, descriptor items, inline payload
//! - Blocking send/receive transport and the request/reply convention
//! - A thread-safe single-assignment promise
//! - A message dispatch server with an ordered handler table
//! - Protocol constants and the filter domain payload types

/// Wire codec for payload values
pub mod codec;

/// Service name and other shared settings
pub mod config;

/// Typed error taxonomy
pub mod error;

/// Filter domain payload types
pub mod filter;

/// Message envelope layout and wire structures
pub mod layout;

/// Message envelopes: building, parsing, extraction
pub mod message;

/// Single-assignment future
pub mod promise;

/// Message-id space of the filtering protocol
pub mod protocol;

/// Named serial worker queues
pub mod queue;

/// Capability handles for port rights
pub mod rights;

/// Message dispatch server
pub mod server;

/// Blocking transport and request/reply convention
pub mod transport;

mod ports;

// Re-export commonly used types for convenience
pub use codec::{decode_value, encode_value, Decode, Decoder, Encode, Encoder};
pub use error::{DecodeError, IpcError, LookupError, ReceiveError, SendError};
pub use layout::{Disposition, LayoutItem, MessageLayout};
pub use message::{Item, Message, PortItem};
pub use ports::{PortName, SenderIdentity};
pub use promise::Promise;
pub use queue::WorkerQueue;
pub use rights::{ReceiveRight, SendOnceRight, SendRight};
pub use server::{AckToken, DispatchServer, MessageHandler};
pub use transport::{
    receive, receive_matching, send, send_error_reply, send_with_empty_reply, send_with_reply,
    send_with_reply_raw, Destination, Reply,
};
