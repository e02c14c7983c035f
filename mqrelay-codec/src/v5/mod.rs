//! MQTT v5.0 protocol codec
//!
//! Properties regions are never interpreted; every packet carries its raw
//! property bytes and re-emits them verbatim, which keeps the codec
//! compatible with property identifiers added after it was written.

pub use crate::types::{ConnectAckFlags, ConnectFlags, QoS};

mod codec;
mod decode;
mod encode;
mod packet;

pub use codec::Codec;
pub use packet::{
    Auth, Connect, ConnectAck, ConnectAckReason, Disconnect, LastWill, Packet, PublishAck, PublishAck2,
    Subscribe, SubscribeAck, Unsubscribe, UnsubscribeAck,
};
