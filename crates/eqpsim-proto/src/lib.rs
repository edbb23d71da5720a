//! Wire protocol primitives for the EQP simulator.
//!
//! This crate covers the two leaf concerns of the simulator:
//!
//! - Framing: turning a raw byte stream into discrete frames and back,
//!   under one of three framing policies (line-end delimiter, start/end
//!   bracket, regex pattern).
//! - Tokens: parsing a decoded frame's text into `NAME=VALUE` pairs and
//!   extracting the `CMD` value.
//!
//! Everything here is synchronous and allocation-light; the async transport
//! and the scenario engine live in other crates.

pub mod framing;
pub mod token;

pub use framing::{FrameDecoder, FramingError, FramingPolicy, LineEnding, parse_hex_sequence};
pub use token::{extract_command, parse_all};
