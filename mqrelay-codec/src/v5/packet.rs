use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{packet_type, QoS};

prim_enum! {
    /// CONNACK reason codes
    #[derive(Deserialize, Serialize)]
    pub enum ConnectAckReason {
        Success = 0,
        UnspecifiedError = 128,
        MalformedPacket = 129,
        ProtocolError = 130,
        ImplementationSpecificError = 131,
        UnsupportedProtocolVersion = 132,
        ClientIdentifierNotValid = 133,
        BadUserNameOrPassword = 134,
        NotAuthorized = 135,
        ServerUnavailable = 136,
        ServerBusy = 137,
        Banned = 138,
        BadAuthenticationMethod = 140,
        TopicNameInvalid = 144,
        PacketTooLarge = 149,
        QuotaExceeded = 151,
        PayloadFormatInvalid = 153,
        RetainNotSupported = 154,
        QosNotSupported = 155,
        UseAnotherServer = 156,
        ServerMoved = 157,
        ConnectionRateExceeded = 159
    }
}

impl From<ConnectAckReason> for u8 {
    fn from(v: ConnectAckReason) -> Self {
        v as u8
    }
}

/// Will message carried by CONNECT; will properties are preserved as raw
/// bytes like every other properties region.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub properties: Bytes,
    pub topic: ByteString,
    pub message: Bytes,
}

/// Connect packet content
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Connect {
    pub clean_start: bool,
    /// keep alive interval in seconds
    pub keep_alive: u16,
    /// raw CONNECT properties region
    pub properties: Bytes,
    pub client_id: ByteString,
    pub last_will: Option<LastWill>,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

/// Connect acknowledgment
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ConnectAck {
    pub session_present: bool,
    pub reason_code: ConnectAckReason,
    pub properties: Bytes,
}

impl Default for ConnectAck {
    fn default() -> Self {
        Self { session_present: false, reason_code: ConnectAckReason::Success, properties: Bytes::new() }
    }
}

pub(crate) type Publish = crate::types::Publish;

/// PUBACK/PUBREC content. The short two-byte wire form maps to reason code 0
/// and empty properties.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PublishAck {
    pub packet_id: NonZeroU16,
    pub reason_code: u8,
    pub properties: Bytes,
}

impl PublishAck {
    pub fn new(packet_id: NonZeroU16) -> Self {
        Self { packet_id, reason_code: 0, properties: Bytes::new() }
    }

    /// True when the canonical encoding is the two-byte short form.
    #[inline]
    pub(crate) fn is_short_form(&self) -> bool {
        self.reason_code == 0 && self.properties.is_empty()
    }
}

/// PUBREL/PUBCOMP content, same short-form rules as [`PublishAck`].
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PublishAck2 {
    pub packet_id: NonZeroU16,
    pub reason_code: u8,
    pub properties: Bytes,
}

impl PublishAck2 {
    pub fn new(packet_id: NonZeroU16) -> Self {
        Self { packet_id, reason_code: 0, properties: Bytes::new() }
    }

    #[inline]
    pub(crate) fn is_short_form(&self) -> bool {
        self.reason_code == 0 && self.properties.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Subscribe {
    pub packet_id: NonZeroU16,
    pub properties: Bytes,
    /// topic filter plus raw subscription options byte
    pub topic_filters: Vec<(ByteString, u8)>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SubscribeAck {
    pub packet_id: NonZeroU16,
    pub properties: Bytes,
    pub status: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Unsubscribe {
    pub packet_id: NonZeroU16,
    pub properties: Bytes,
    pub topic_filters: Vec<ByteString>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct UnsubscribeAck {
    pub packet_id: NonZeroU16,
    pub properties: Bytes,
    pub status: Vec<u8>,
}

/// DISCONNECT; a zero-length remaining region means normal disconnection.
#[derive(Debug, PartialEq, Eq, Clone, Default, Deserialize, Serialize)]
pub struct Disconnect {
    pub reason_code: u8,
    pub properties: Bytes,
}

/// AUTH exchange packet. Recognized so the codec round-trips it; the proxy
/// has no handler for extended authentication.
#[derive(Debug, PartialEq, Eq, Clone, Default, Deserialize, Serialize)]
pub struct Auth {
    pub reason_code: u8,
    pub properties: Bytes,
}

/// MQTT 5.0 Control Packets
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// Client request to connect to Server
    Connect(Box<Connect>),
    /// Connect acknowledgment
    ConnectAck(ConnectAck),
    /// Publish message
    Publish(Publish),
    /// Publish acknowledgment
    PublishAck(PublishAck),
    /// Publish received (assured delivery part 1)
    PublishReceived(PublishAck),
    /// Publish release (assured delivery part 2)
    PublishRelease(PublishAck2),
    /// Publish complete (assured delivery part 3)
    PublishComplete(PublishAck2),
    /// Client subscribe request
    Subscribe(Subscribe),
    /// Subscribe acknowledgment
    SubscribeAck(SubscribeAck),
    /// Unsubscribe request
    Unsubscribe(Unsubscribe),
    /// Unsubscribe acknowledgment
    UnsubscribeAck(UnsubscribeAck),
    /// PING request
    PingRequest,
    /// PING response
    PingResponse,
    /// Disconnection is advertised
    Disconnect(Disconnect),
    /// Auth exchange
    Auth(Auth),
}

impl From<Connect> for Packet {
    fn from(pkt: Connect) -> Self {
        Self::Connect(Box::new(pkt))
    }
}

impl From<Publish> for Packet {
    fn from(pkt: Publish) -> Self {
        Self::Publish(pkt)
    }
}

impl From<ConnectAck> for Packet {
    fn from(pkt: ConnectAck) -> Self {
        Self::ConnectAck(pkt)
    }
}

impl From<Disconnect> for Packet {
    fn from(pkt: Disconnect) -> Self {
        Self::Disconnect(pkt)
    }
}

impl Packet {
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => packet_type::CONNECT,
            Packet::ConnectAck(_) => packet_type::CONNACK,
            Packet::Publish(_) => packet_type::PUBLISH_START,
            Packet::PublishAck(_) => packet_type::PUBACK,
            Packet::PublishReceived(_) => packet_type::PUBREC,
            Packet::PublishRelease(_) => packet_type::PUBREL,
            Packet::PublishComplete(_) => packet_type::PUBCOMP,
            Packet::Subscribe(_) => packet_type::SUBSCRIBE,
            Packet::SubscribeAck(_) => packet_type::SUBACK,
            Packet::Unsubscribe(_) => packet_type::UNSUBSCRIBE,
            Packet::UnsubscribeAck(_) => packet_type::UNSUBACK,
            Packet::PingRequest => packet_type::PINGREQ,
            Packet::PingResponse => packet_type::PINGRESP,
            Packet::Disconnect(_) => packet_type::DISCONNECT,
            Packet::Auth(_) => packet_type::AUTH,
        }
    }
}
