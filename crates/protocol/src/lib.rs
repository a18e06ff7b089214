//! Call protocol for taskfarm worker channels.
//!
//! Defines the message envelopes exchanged between the pool coordinator and a
//! worker process, in both directions, plus the line-delimited JSON codec used
//! on the child's stdio. The envelope variant is the direction discriminant;
//! correlation is by call id, scoped per channel and per direction.

pub mod envelope;
pub mod wire;

pub use envelope::{CallId, Envelope, ErrorKind, ErrorPayload};
pub use wire::{decode_line, encode_line, WireError};
