use std::num::NonZeroU16;

use bytes::{Buf, Bytes};
use bytestring::ByteString;

use crate::error::DecodeError;
use crate::types::{packet_type, QoS, MQTT, MQTT_LEVEL_5, WILL_QOS_SHIFT};
use crate::utils::{take_properties, Decode};

use super::packet::*;
use super::{ConnectAckFlags, ConnectFlags};

pub(crate) fn decode_packet(mut src: Bytes, first_byte: u8) -> Result<Packet, DecodeError> {
    match first_byte {
        packet_type::CONNECT => decode_connect_packet(&mut src),
        packet_type::CONNACK => decode_connect_ack_packet(&mut src),
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => {
            decode_publish_packet(&mut src, first_byte & 0b0000_1111)
        }
        packet_type::PUBACK => Ok(Packet::PublishAck(decode_publish_ack(&mut src)?)),
        packet_type::PUBREC => Ok(Packet::PublishReceived(decode_publish_ack(&mut src)?)),
        packet_type::PUBREL => Ok(Packet::PublishRelease(decode_publish_ack2(&mut src)?)),
        packet_type::PUBCOMP => Ok(Packet::PublishComplete(decode_publish_ack2(&mut src)?)),
        packet_type::SUBSCRIBE => decode_subscribe_packet(&mut src),
        packet_type::SUBACK => decode_subscribe_ack_packet(&mut src),
        packet_type::UNSUBSCRIBE => decode_unsubscribe_packet(&mut src),
        packet_type::UNSUBACK => decode_unsubscribe_ack_packet(&mut src),
        packet_type::PINGREQ => Ok(Packet::PingRequest),
        packet_type::PINGRESP => Ok(Packet::PingResponse),
        packet_type::DISCONNECT => decode_disconnect_packet(&mut src),
        packet_type::AUTH => decode_auth_packet(&mut src),
        _ => Err(DecodeError::UnsupportedPacketType),
    }
}

fn decode_connect_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() >= 10, DecodeError::InvalidLength);
    let len = src.get_u16();

    if len == 4 && &src.as_ref()[0..4] == MQTT {
        src.advance(4);
    } else {
        return Err(DecodeError::InvalidProtocol);
    }

    let level = src.get_u8();
    ensure!(level == MQTT_LEVEL_5, DecodeError::UnsupportedProtocolLevel);

    let flags = ConnectFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnectReservedFlagSet)?;

    let keep_alive = u16::decode(src)?;
    let properties = take_properties(src)?;
    let client_id = ByteString::decode(src)?;

    let last_will = if flags.contains(ConnectFlags::WILL) {
        let will_properties = take_properties(src)?;
        let topic = ByteString::decode(src)?;
        let message = Bytes::decode(src)?;
        Some(LastWill {
            qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
            properties: will_properties,
            topic,
            message,
        })
    } else {
        None
    };
    let username = if flags.contains(ConnectFlags::USERNAME) { Some(ByteString::decode(src)?) } else { None };
    let password = if flags.contains(ConnectFlags::PASSWORD) { Some(Bytes::decode(src)?) } else { None };
    Ok(Connect {
        clean_start: flags.contains(ConnectFlags::CLEAN_START),
        keep_alive,
        properties,
        client_id,
        last_will,
        username,
        password,
    }
    .into())
}

fn decode_connect_ack_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let flags = ConnectAckFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnAckReservedFlagSet)?;
    let reason_code = src.get_u8().try_into()?;
    let properties = if src.has_remaining() { take_properties(src)? } else { Bytes::new() };
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(Packet::ConnectAck(ConnectAck {
        session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
        reason_code,
        properties,
    }))
}

fn decode_publish_packet(src: &mut Bytes, packet_flags: u8) -> Result<Packet, DecodeError> {
    let topic = ByteString::decode(src)?;
    let qos = QoS::try_from((packet_flags & 0b0110) >> 1)?;
    let packet_id = if qos == QoS::AtMostOnce { None } else { Some(NonZeroU16::decode(src)?) };

    let properties = take_properties(src)?;
    // whatever remains after topic, packet id and properties is the payload
    let payload = src.split_off(0);

    Ok(Packet::Publish(Publish {
        dup: (packet_flags & 0b1000) == 0b1000,
        qos,
        retain: (packet_flags & 0b0001) == 0b0001,
        topic,
        packet_id,
        payload,
        properties: Some(properties),
    }))
}

/// Parses PUBACK/PUBREC: the two-byte short form stands for reason code 0
/// with no properties.
fn decode_publish_ack(src: &mut Bytes) -> Result<PublishAck, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let ack = if src.has_remaining() {
        let reason_code = src.get_u8();
        if src.has_remaining() {
            let properties = take_properties(src)?;
            ensure!(!src.has_remaining(), DecodeError::InvalidLength);
            PublishAck { packet_id, reason_code, properties }
        } else {
            PublishAck { packet_id, reason_code, properties: Bytes::new() }
        }
    } else {
        PublishAck::new(packet_id)
    };
    Ok(ack)
}

fn decode_publish_ack2(src: &mut Bytes) -> Result<PublishAck2, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let ack = if src.has_remaining() {
        let reason_code = src.get_u8();
        if src.has_remaining() {
            let properties = take_properties(src)?;
            ensure!(!src.has_remaining(), DecodeError::InvalidLength);
            PublishAck2 { packet_id, reason_code, properties }
        } else {
            PublishAck2 { packet_id, reason_code, properties: Bytes::new() }
        }
    } else {
        PublishAck2::new(packet_id)
    };
    Ok(ack)
}

fn decode_subscribe_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = take_properties(src)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        let topic = ByteString::decode(src)?;
        ensure!(src.remaining() >= 1, DecodeError::InvalidLength);
        topic_filters.push((topic, src.get_u8()));
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, properties, topic_filters }))
}

fn decode_subscribe_ack_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = take_properties(src)?;
    let status = src.split_off(0).to_vec();
    Ok(Packet::SubscribeAck(SubscribeAck { packet_id, properties, status }))
}

fn decode_unsubscribe_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = take_properties(src)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        topic_filters.push(ByteString::decode(src)?);
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, properties, topic_filters }))
}

fn decode_unsubscribe_ack_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = take_properties(src)?;
    let status = src.split_off(0).to_vec();
    Ok(Packet::UnsubscribeAck(UnsubscribeAck { packet_id, properties, status }))
}

fn decode_disconnect_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    if !src.has_remaining() {
        return Ok(Packet::Disconnect(Disconnect::default()));
    }
    let reason_code = src.get_u8();
    let properties = if src.has_remaining() { take_properties(src)? } else { Bytes::new() };
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(Packet::Disconnect(Disconnect { reason_code, properties }))
}

fn decode_auth_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    if !src.has_remaining() {
        return Ok(Packet::Auth(Auth::default()));
    }
    let reason_code = src.get_u8();
    let properties = if src.has_remaining() { take_properties(src)? } else { Bytes::new() };
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(Packet::Auth(Auth { reason_code, properties }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    #[test]
    fn test_decode_connect_packet() {
        // clean start, keep alive 60, no properties, client id "12345"
        let mut src = Bytes::from_static(b"\x00\x04MQTT\x05\x02\x00\x3c\x00\x00\x0512345");
        let packet = decode_connect_packet(&mut src).unwrap();
        assert_eq!(
            packet,
            Packet::Connect(Box::new(Connect {
                clean_start: true,
                keep_alive: 60,
                properties: Bytes::new(),
                client_id: ByteString::from_static("12345"),
                last_will: None,
                username: None,
                password: None,
            }))
        );
    }

    #[test]
    fn test_decode_connect_preserves_raw_properties() {
        // properties region: session expiry interval (0x11) = 16
        let mut src =
            Bytes::from_static(b"\x00\x04MQTT\x05\x02\x00\x3c\x05\x11\x00\x00\x00\x10\x00\x0512345");
        let packet = decode_connect_packet(&mut src).unwrap();
        let Packet::Connect(connect) = packet else { panic!() };
        assert_eq!(connect.properties, Bytes::from_static(b"\x11\x00\x00\x00\x10"));
    }

    #[test]
    fn test_decode_connect_wrong_level() {
        let mut src = Bytes::from_static(b"\x00\x04MQTT\x04\x02\x00\x3c\x00\x00\x0512345");
        assert!(matches!(
            decode_connect_packet(&mut src),
            Err(DecodeError::UnsupportedProtocolLevel)
        ));
    }

    #[test]
    fn test_decode_publish_packet() {
        // qos 1, topic "dummy", packet id 1, empty properties, payload "on"
        let mut src = Bytes::from_static(b"\x00\x05dummy\x00\x01\x00on");
        let packet = decode_publish_packet(&mut src, 0b0010).unwrap();
        assert_eq!(
            packet,
            Packet::Publish(Publish {
                dup: false,
                retain: false,
                qos: QoS::AtLeastOnce,
                topic: ByteString::from_static("dummy"),
                packet_id: Some(packet_id(1)),
                payload: Bytes::from_static(b"on"),
                properties: Some(Bytes::new()),
            })
        );
    }

    #[test]
    fn test_decode_publish_properties_longer_than_packet() {
        // declared property length 5 but only 2 bytes follow
        let mut src = Bytes::from_static(b"\x00\x05dummy\x00\x01\x05\x01\x00");
        assert!(matches!(
            decode_publish_packet(&mut src, 0b0010),
            Err(DecodeError::InvalidLength)
        ));
    }

    #[test_case(b"\x00\x01", 1, 0, b"" ; "short_form")]
    #[test_case(b"\x00\x01\x10", 1, 0x10, b"" ; "reason_no_props")]
    #[test_case(b"\x00\x01\x87\x00", 1, 0x87, b"" ; "reason_empty_props")]
    #[test_case(b"\x00\xff\x80\x05\x1f\x00\x02no", 255, 0x80, b"\x1f\x00\x02no" ; "reason_and_props")]
    fn puback_decode(input: &'static [u8], id: u16, reason: u8, props: &'static [u8]) {
        let mut src = Bytes::from_static(input);
        let ack = decode_publish_ack(&mut src).unwrap();
        assert_eq!(
            ack,
            PublishAck {
                packet_id: packet_id(id),
                reason_code: reason,
                properties: Bytes::from_static(props)
            }
        );
    }

    #[test_case(b"\x00\x00" ; "packet_id_zero")]
    #[test_case(b"\x00\x01\x00\x05\x01" ; "props_shorter_than_declared")]
    fn puback_decode_must_fail(input: &'static [u8]) {
        let mut src = Bytes::from_static(input);
        assert!(decode_publish_ack(&mut src).is_err());
    }

    #[test]
    fn test_decode_disconnect() {
        let mut src = Bytes::new();
        assert_eq!(
            decode_disconnect_packet(&mut src).unwrap(),
            Packet::Disconnect(Disconnect { reason_code: 0, properties: Bytes::new() })
        );

        let mut src = Bytes::from_static(b"\x04");
        assert_eq!(
            decode_disconnect_packet(&mut src).unwrap(),
            Packet::Disconnect(Disconnect { reason_code: 4, properties: Bytes::new() })
        );
    }

    #[test]
    fn test_decode_subscribe() {
        let mut src = Bytes::from_static(b"\x12\x34\x00\x00\x04test\x01");
        let packet = decode_subscribe_packet(&mut src).unwrap();
        assert_eq!(
            packet,
            Packet::Subscribe(Subscribe {
                packet_id: packet_id(0x1234),
                properties: Bytes::new(),
                topic_filters: vec![(ByteString::from_static("test"), 1)],
            })
        );
    }
}
