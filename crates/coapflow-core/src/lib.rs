//! coapflow Core
//!
//! Protocol vocabulary shared by the coapflow message-handling crates.
//!
//! This crate provides:
//! - Codes and message types ([`Method`], [`ResponseCode`], [`MessageType`])
//! - Content formats ([`MediaType`])
//! - Messages ([`Request`], [`Response`], [`EmptyMessage`])
//! - Request/response transactions ([`Exchange`])
//! - Endpoint addressing and URI paths ([`EndpointAddress`])
//! - Monotonic clocks ([`Clock`], [`SystemClock`], [`ManualClock`])
//!
//! Wire encoding is not part of this crate; messages are already decoded
//! when they reach the pipeline.

pub mod address;
pub mod error;
pub mod exchange;
pub mod media;
pub mod message;
pub mod time;
pub mod types;

pub use address::EndpointAddress;
pub use error::{Error, Result};
pub use exchange::{Exchange, ExchangeId, ObserveOrderer, Origin, RelationHandle, Responder};
pub use media::MediaType;
pub use message::{EmptyMessage, Message, Request, Response};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::*;

/// Default CoAP UDP port
pub const DEFAULT_PORT: u16 = 5683;

/// Freshness lifetime assumed when a response carries no Max-Age option (seconds)
pub const DEFAULT_MAX_AGE: u32 = 60;
