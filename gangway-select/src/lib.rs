mod dialer_select;
mod listener;
mod negotiated;
mod protocol;

pub use dialer_select::dialer_select;
pub use listener::listener_select;
pub use negotiated::{Negotiated, NegotiationError};
pub use protocol::ProtocolError;
