//! # coapd-msg: CoAP Message Layer (RFC 7252)
//!
//! This crate provides the pure message layer of a CoAP-over-UDP endpoint:
//! parsing and serialization of datagrams, the response-code registry, the
//! option registry, and block-option arithmetic (RFC 7959). It performs no
//! I/O and has no opinion about transports or schedulers; the `coapd` crate
//! builds the runtime on top of it.
//!
//! ## Architecture Overview
//!
//! ```text
//! coapd-msg/
//! ├── error    - Decode/encode error taxonomy
//! ├── types    - Message type, message ID, token, content formats
//! ├── code     - Request/response code registry (RFC 7252 Section 12.1)
//! ├── option   - Option registry and per-option validation (Section 5.10)
//! ├── block    - Block1/Block2 option arithmetic (RFC 7959)
//! ├── message  - The Message model and option accessors
//! └── codec    - Wire codec (Section 3): header, token, options, payload
//! ```
//!
//! ## Design Principles
//!
//! 1. **Zero-Copy Decoding**: option values and the payload of a decoded
//!    [`Message`] are `bytes::Bytes` slices of the input datagram; no
//!    per-option buffers are allocated.
//!
//! 2. **Caller-Provided Output Buffers**: [`codec::encode`] writes into a
//!    `&mut [u8]` supplied by the caller and reports the length used,
//!    allowing buffer pooling at the transport layer.
//!
//! 3. **Deterministic**: every function is a pure transformation of its
//!    inputs; all protocol constants live in this crate.

#![forbid(unsafe_code)]

pub mod block;
pub mod code;
pub mod codec;
pub mod error;
pub mod message;
pub mod option;
pub mod types;

pub use block::{BlockValue, Szx};
pub use code::Code;
pub use codec::{decode, decode_bounded, encode};
pub use error::{DecodeError, EncodeError};
pub use message::{CoapOption, Message};
pub use option::OptionDef;
pub use types::{ContentFormat, MessageId, MessageType, Token};
