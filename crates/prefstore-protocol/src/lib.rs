//! # prefstore-protocol
//!
//! Wire protocol between preference clients and the privileged helper.
//!
//! This crate defines the command set, status codes, request/response
//! payloads and the length-prefixed frame codec.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, Frame, FrameError};
pub use messages::*;
