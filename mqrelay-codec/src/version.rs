use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::types::{packet_type, MQTT, MQTT_LEVEL_311, MQTT_LEVEL_5};
use crate::utils;

/// Supported MQTT dialects
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1 (protocol level 4)
    MQTT3,
    /// MQTT 5.0 (protocol level 5)
    MQTT5,
}

impl ProtocolVersion {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::MQTT3 => "MQTTv3.1.1",
            ProtocolVersion::MQTT5 => "MQTTv5",
        }
    }
}

/// Wire bytes of the negative CONNACK sent when the protocol level is not
/// 4 or 5: session-present 0, return code `UnacceptableProtocolVersion`.
pub const UNACCEPTABLE_PROTOCOL_CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x01];

/// MQTT 5 reason code for the same refusal, for callers that already know
/// the peer speaks the 5.0 dialect.
pub const UNSUPPORTED_PROTOCOL_VERSION_V5: u8 = 0x84;

/// Codec that inspects the first CONNECT packet to determine the protocol
/// version without consuming any bytes. The `Framed` read buffer keeps the
/// packet intact, so swapping in the version-specific codec replays it; this
/// is the tee-and-replay step of version negotiation.
#[derive(Debug)]
pub struct VersionCodec;

impl Decoder for VersionCodec {
    type Item = ProtocolVersion;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.len();
        if len < 2 {
            return Ok(None);
        }

        let src_slice = src.as_ref();
        let first_byte = src_slice[0];
        match utils::decode_variable_length(&src_slice[1..])? {
            Some((_, mut consumed)) => {
                consumed += 1;

                if first_byte != packet_type::CONNECT {
                    return Err(DecodeError::UnsupportedPacketType);
                }
                if len <= consumed + 6 {
                    return Ok(None);
                }

                let protocol_len = u16::from_be_bytes(
                    src[consumed..consumed + 2].try_into().map_err(|_| DecodeError::InvalidProtocol)?,
                );
                ensure!(
                    protocol_len == 4 && &src[consumed + 2..consumed + 6] == MQTT,
                    DecodeError::InvalidProtocol
                );

                match src[consumed + 2 + protocol_len as usize] {
                    MQTT_LEVEL_311 => Ok(Some(ProtocolVersion::MQTT3)),
                    MQTT_LEVEL_5 => Ok(Some(ProtocolVersion::MQTT5)),
                    _ => Err(DecodeError::UnsupportedProtocolLevel),
                }
            }
            None => Ok(None),
        }
    }
}

impl Encoder<ProtocolVersion> for VersionCodec {
    type Error = EncodeError;

    fn encode(&mut self, _: ProtocolVersion, _: &mut BytesMut) -> Result<(), Self::Error> {
        Err(EncodeError::UnsupportedVersion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_invalid_protocol_name() {
        let mut buf = BytesMut::from(
            b"\x10\x23\x00\x04MQXX\x04\x02\x00\x3c\x00\x0512345".as_ref(),
        );
        assert!(matches!(VersionCodec.decode(&mut buf), Err(DecodeError::InvalidProtocol)));
    }

    #[test]
    fn test_mqtt3_protocol_detection() {
        let mut buf = BytesMut::from(b"\x10\x98\x02\0\x04MQTT\x04\xc0\0\x0f\0\x02d1\0|testhub.".as_ref());
        let before = buf.len();
        assert_eq!(VersionCodec.decode(&mut buf).unwrap(), Some(ProtocolVersion::MQTT3));
        // nothing consumed, the buffered packet is replayed by the real codec
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn test_mqtt5_protocol_detection() {
        let mut buf = BytesMut::from(b"\x10\x98\x02\0\x04MQTT\x05\xc0\0\x0f\0\x02d1\0|testhub.".as_ref());
        assert_eq!(VersionCodec.decode(&mut buf).unwrap(), Some(ProtocolVersion::MQTT5));
    }

    #[test]
    fn test_unsupported_levels() {
        for level in [3u8, 6u8] {
            let mut buf = BytesMut::from(b"\x10\x10\x00\x04MQTT".as_ref());
            buf.extend_from_slice(&[level]);
            buf.extend_from_slice(b"\x02\x00\x3c\x00\x00");
            assert!(
                matches!(VersionCodec.decode(&mut buf), Err(DecodeError::UnsupportedProtocolLevel)),
                "level {}",
                level
            );
        }
    }

    #[test]
    fn test_partial_packet_handling() {
        let mut buf = BytesMut::from(b"\x10\x98\x02\0\x04MQTT\x05".as_ref());
        assert_eq!(VersionCodec.decode(&mut buf).unwrap(), Some(ProtocolVersion::MQTT5));

        let mut buf = BytesMut::from(b"\x10\x98\x02\0\x04".as_ref());
        assert_eq!(VersionCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_non_connect_first_packet() {
        let mut buf = BytesMut::from(b"\x30\x0b\x00\x05topicdata".as_ref());
        assert!(matches!(VersionCodec.decode(&mut buf), Err(DecodeError::UnsupportedPacketType)));
    }
}
