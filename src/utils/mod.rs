//! Utility modules

pub mod error;
pub mod resp;

pub use error::{ClientError, ConnectionError, ProtocolError, Result};
pub use resp::{RespDecoder, RespEncoder, RespValue};
