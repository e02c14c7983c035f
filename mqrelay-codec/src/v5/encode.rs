use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::types::{packet_type, ConnectFlags, QoS, MQTT_LEVEL_5, WILL_QOS_SHIFT};
use crate::utils::{properties_size, write_properties, write_variable_length, Encode};

use super::packet::*;

pub(crate) fn get_encoded_size(packet: &Packet) -> usize {
    match *packet {
        Packet::Connect(ref connect) => {
            let Connect { ref properties, ref client_id, ref last_will, ref username, ref password, .. } =
                **connect;

            // Protocol Name + Level + Connect Flags + Keep Alive
            let mut n = 2 + 4 + 1 + 1 + 2;
            n += properties_size(properties);
            n += 2 + client_id.len();

            if let Some(LastWill { ref properties, ref topic, ref message, .. }) = *last_will {
                n += properties_size(properties) + 2 + topic.len() + 2 + message.len();
            }
            if let Some(ref s) = *username {
                n += 2 + s.len();
            }
            if let Some(ref s) = *password {
                n += 2 + s.len();
            }
            n
        }

        Packet::ConnectAck(ref ack) => 1 + 1 + properties_size(&ack.properties),

        Packet::Publish(ref publish) => {
            let packet_id_size = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
            let props =
                publish.properties.as_ref().map(properties_size).unwrap_or(1);
            2 + publish.topic.len() + packet_id_size + props + publish.payload.len()
        }

        Packet::PublishAck(ref ack) | Packet::PublishReceived(ref ack) => {
            if ack.is_short_form() {
                2
            } else {
                2 + 1 + properties_size(&ack.properties)
            }
        }
        Packet::PublishRelease(ref ack) | Packet::PublishComplete(ref ack) => {
            if ack.is_short_form() {
                2
            } else {
                2 + 1 + properties_size(&ack.properties)
            }
        }

        Packet::Subscribe(ref sub) => {
            2 + properties_size(&sub.properties)
                + sub.topic_filters.iter().fold(0, |acc, (filter, _)| acc + 2 + filter.len() + 1)
        }
        Packet::SubscribeAck(ref ack) => 2 + properties_size(&ack.properties) + ack.status.len(),
        Packet::Unsubscribe(ref unsub) => {
            2 + properties_size(&unsub.properties)
                + unsub.topic_filters.iter().fold(0, |acc, filter| acc + 2 + filter.len())
        }
        Packet::UnsubscribeAck(ref ack) => 2 + properties_size(&ack.properties) + ack.status.len(),

        Packet::PingRequest | Packet::PingResponse => 0,

        Packet::Disconnect(ref disc) => {
            if disc.reason_code == 0 && disc.properties.is_empty() {
                0
            } else {
                1 + properties_size(&disc.properties)
            }
        }
        Packet::Auth(ref auth) => {
            if auth.reason_code == 0 && auth.properties.is_empty() {
                0
            } else {
                1 + properties_size(&auth.properties)
            }
        }
    }
}

pub(crate) fn encode(packet: &Packet, dst: &mut BytesMut, content_size: u32) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(connect) => {
            dst.put_u8(packet_type::CONNECT);
            write_variable_length(content_size, dst);
            encode_connect(connect, dst)?;
        }
        Packet::ConnectAck(ack) => {
            dst.put_u8(packet_type::CONNACK);
            write_variable_length(content_size, dst);
            dst.put_u8(u8::from(ack.session_present));
            dst.put_u8(ack.reason_code.into());
            write_properties(&ack.properties, dst);
        }
        Packet::Publish(publish) => {
            dst.put_u8(
                packet_type::PUBLISH_START
                    | (u8::from(publish.qos) << 1)
                    | ((publish.dup as u8) << 3)
                    | (publish.retain as u8),
            );
            write_variable_length(content_size, dst);
            publish.topic.encode(dst)?;
            if publish.qos == QoS::AtMostOnce {
                if publish.packet_id.is_some() {
                    return Err(EncodeError::MalformedPacket); // packet id must not be set
                }
            } else {
                publish.packet_id.ok_or(EncodeError::PacketIdRequired)?.encode(dst)?;
            }
            match publish.properties.as_ref() {
                Some(props) => write_properties(props, dst),
                None => dst.put_u8(0),
            }
            dst.put(publish.payload.as_ref());
        }

        Packet::PublishAck(ack) => encode_publish_ack(packet_type::PUBACK, ack, dst, content_size)?,
        Packet::PublishReceived(ack) => encode_publish_ack(packet_type::PUBREC, ack, dst, content_size)?,
        Packet::PublishRelease(ack) => encode_publish_ack2(packet_type::PUBREL, ack, dst, content_size)?,
        Packet::PublishComplete(ack) => encode_publish_ack2(packet_type::PUBCOMP, ack, dst, content_size)?,

        Packet::Subscribe(sub) => {
            dst.put_u8(packet_type::SUBSCRIBE);
            write_variable_length(content_size, dst);
            sub.packet_id.encode(dst)?;
            write_properties(&sub.properties, dst);
            for (filter, options) in &sub.topic_filters {
                filter.encode(dst)?;
                dst.put_u8(*options);
            }
        }
        Packet::SubscribeAck(ack) => {
            dst.put_u8(packet_type::SUBACK);
            write_variable_length(content_size, dst);
            ack.packet_id.encode(dst)?;
            write_properties(&ack.properties, dst);
            dst.put_slice(&ack.status);
        }
        Packet::Unsubscribe(unsub) => {
            dst.put_u8(packet_type::UNSUBSCRIBE);
            write_variable_length(content_size, dst);
            unsub.packet_id.encode(dst)?;
            write_properties(&unsub.properties, dst);
            for filter in &unsub.topic_filters {
                filter.encode(dst)?;
            }
        }
        Packet::UnsubscribeAck(ack) => {
            dst.put_u8(packet_type::UNSUBACK);
            write_variable_length(content_size, dst);
            ack.packet_id.encode(dst)?;
            write_properties(&ack.properties, dst);
            dst.put_slice(&ack.status);
        }

        Packet::PingRequest => dst.put_slice(&[packet_type::PINGREQ, 0]),
        Packet::PingResponse => dst.put_slice(&[packet_type::PINGRESP, 0]),

        Packet::Disconnect(disc) => {
            dst.put_u8(packet_type::DISCONNECT);
            write_variable_length(content_size, dst);
            if !(disc.reason_code == 0 && disc.properties.is_empty()) {
                dst.put_u8(disc.reason_code);
                write_properties(&disc.properties, dst);
            }
        }
        Packet::Auth(auth) => {
            dst.put_u8(packet_type::AUTH);
            write_variable_length(content_size, dst);
            if !(auth.reason_code == 0 && auth.properties.is_empty()) {
                dst.put_u8(auth.reason_code);
                write_properties(&auth.properties, dst);
            }
        }
    }

    Ok(())
}

/// PUBACK/PUBREC: the short form MUST be produced when reason code is 0 and
/// properties are empty.
fn encode_publish_ack(
    first_byte: u8,
    ack: &PublishAck,
    dst: &mut BytesMut,
    content_size: u32,
) -> Result<(), EncodeError> {
    dst.put_u8(first_byte);
    write_variable_length(content_size, dst);
    ack.packet_id.encode(dst)?;
    if !ack.is_short_form() {
        dst.put_u8(ack.reason_code);
        write_properties(&ack.properties, dst);
    }
    Ok(())
}

fn encode_publish_ack2(
    first_byte: u8,
    ack: &PublishAck2,
    dst: &mut BytesMut,
    content_size: u32,
) -> Result<(), EncodeError> {
    dst.put_u8(first_byte);
    write_variable_length(content_size, dst);
    ack.packet_id.encode(dst)?;
    if !ack.is_short_form() {
        dst.put_u8(ack.reason_code);
        write_properties(&ack.properties, dst);
    }
    Ok(())
}

fn encode_connect(connect: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let Connect {
        clean_start,
        keep_alive,
        ref properties,
        ref client_id,
        ref last_will,
        ref username,
        ref password,
    } = *connect;

    b"MQTT".as_slice().encode(dst)?;

    let mut flags = ConnectFlags::empty();

    if username.is_some() {
        flags |= ConnectFlags::USERNAME;
    }
    if password.is_some() {
        flags |= ConnectFlags::PASSWORD;
    }
    if let Some(LastWill { qos, retain, .. }) = *last_will {
        flags |= ConnectFlags::WILL;
        if retain {
            flags |= ConnectFlags::WILL_RETAIN;
        }
        flags |= ConnectFlags::from_bits_truncate((qos as u8) << WILL_QOS_SHIFT);
    }
    if clean_start {
        flags |= ConnectFlags::CLEAN_START;
    }

    dst.put_slice(&[MQTT_LEVEL_5, flags.bits()]);
    dst.put_u16(keep_alive);
    write_properties(properties, dst);
    client_id.encode(dst)?;

    if let Some(LastWill { ref properties, ref topic, ref message, .. }) = *last_will {
        write_properties(properties, dst);
        topic.encode(dst)?;
        message.encode(dst)?;
    }
    if let Some(ref s) = *username {
        s.encode(dst)?;
    }
    if let Some(ref s) = *password {
        s.encode(dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use bytestring::ByteString;
    use std::num::NonZeroU16;

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn assert_encode_packet(packet: &Packet, expected: &[u8]) {
        let mut v = BytesMut::with_capacity(1024);
        encode(packet, &mut v, get_encoded_size(packet) as u32).unwrap();
        assert_eq!(expected.len(), v.len());
        assert_eq!(expected, &v[..]);
    }

    #[test]
    fn test_encode_connect_ack() {
        assert_encode_packet(&Packet::ConnectAck(ConnectAck::default()), b"\x20\x03\x00\x00\x00");
        assert_encode_packet(
            &Packet::ConnectAck(ConnectAck {
                session_present: false,
                reason_code: ConnectAckReason::BadUserNameOrPassword,
                properties: Bytes::new(),
            }),
            b"\x20\x03\x00\x86\x00",
        );
    }

    #[test]
    fn test_encode_publish() {
        assert_encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                retain: false,
                qos: QoS::AtLeastOnce,
                topic: ByteString::from_static("dummy"),
                packet_id: Some(packet_id(1)),
                payload: Bytes::from_static(b"on"),
                properties: Some(Bytes::new()),
            }),
            b"\x32\x0c\x00\x05dummy\x00\x01\x00on",
        );
    }

    #[test]
    fn test_encode_short_form_acks() {
        assert_encode_packet(&Packet::PublishAck(PublishAck::new(packet_id(1))), b"\x40\x02\x00\x01");
        assert_encode_packet(&Packet::PublishReceived(PublishAck::new(packet_id(1))), b"\x50\x02\x00\x01");
        assert_encode_packet(&Packet::PublishRelease(PublishAck2::new(packet_id(1))), b"\x62\x02\x00\x01");
        assert_encode_packet(&Packet::PublishComplete(PublishAck2::new(packet_id(1))), b"\x70\x02\x00\x01");
    }

    #[test]
    fn test_encode_long_form_ack() {
        assert_encode_packet(
            &Packet::PublishAck(PublishAck {
                packet_id: packet_id(1),
                reason_code: 0x87,
                properties: Bytes::new(),
            }),
            b"\x40\x04\x00\x01\x87\x00",
        );
    }

    #[test]
    fn test_encode_disconnect() {
        assert_encode_packet(&Packet::Disconnect(Disconnect::default()), b"\xe0\x00");
        assert_encode_packet(
            &Packet::Disconnect(Disconnect { reason_code: 0x81, properties: Bytes::new() }),
            b"\xe0\x02\x81\x00",
        );
    }

    #[test]
    fn test_encode_ping_packets() {
        assert_encode_packet(&Packet::PingRequest, b"\xc0\x00");
        assert_encode_packet(&Packet::PingResponse, b"\xd0\x00");
    }
}
