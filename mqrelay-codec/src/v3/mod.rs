//! MQTT v3.1.1 protocol codec

pub use crate::types::{ConnectAckFlags, ConnectFlags, QoS};

mod codec;
mod decode;
mod encode;
mod packet;

pub use codec::Codec;
pub use packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, SubscribeReturnCode};
