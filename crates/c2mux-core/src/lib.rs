//! c2mux-core: shared protocol library for the c2mux control plane.
//!
//! Provides the envelope and message-type codes, CBOR payload codec,
//! unpredictable ID generation, and the abstract envelope transport.

pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode, decode_envelope, encode_envelope};
pub use error::{MuxError, MuxResult};
pub use messages::{Envelope, MsgType};
pub use transport::{channel_transport, ChannelPeer, EnvelopeSink, EnvelopeSource};
