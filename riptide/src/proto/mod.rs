/// Wire event model
pub mod event;

/// Framed big-endian codec
pub mod codec;

pub use codec::DcpCodec;
pub use event::DcpEvent;
