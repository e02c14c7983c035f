use std::cell::Cell;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{decode::decode_packet, encode, Packet};
use crate::error::{DecodeError, EncodeError};
use crate::types::{FixedHeader, MAX_PACKET_SIZE};
use crate::utils::decode_variable_length;

/// Mqtt v5.0 protocol codec
#[derive(Debug, Clone)]
pub struct Codec {
    state: Cell<DecodeState>,
    max_in_size: Cell<u32>,
    max_out_size: Cell<u32>,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

impl Codec {
    /// Create `Codec` instance
    pub fn new(max_in_size: u32, max_out_size: u32) -> Self {
        Codec {
            state: Cell::new(DecodeState::FrameHeader),
            max_in_size: Cell::new(max_in_size),
            max_out_size: Cell::new(max_out_size),
        }
    }

    /// Set max inbound frame size; `0` means unlimited.
    pub fn set_max_inbound_size(&mut self, size: u32) {
        self.max_in_size.set(size);
    }

    /// Set max outbound frame size; `0` means unlimited.
    pub fn set_max_outbound_size(&mut self, mut size: u32) {
        if size > 5 {
            // fixed header byte + max variable length bytes
            size -= 5;
        }
        self.max_out_size.set(size);
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Decoder for Codec {
    type Item = (Packet, u32);
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state.get() {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let src_slice = src.as_ref();
                    let first_byte = src_slice[0];
                    match decode_variable_length(&src_slice[1..])? {
                        Some((remaining_length, consumed)) => {
                            let max_in_size = self.max_in_size.get();
                            if max_in_size != 0 && max_in_size < remaining_length {
                                log::debug!(
                                    "MaxSizeExceeded max-size: {}, remaining: {}",
                                    max_in_size,
                                    remaining_length
                                );
                                return Err(DecodeError::MaxSizeExceeded);
                            }
                            src.advance(consumed + 1);
                            self.state.set(DecodeState::Frame(FixedHeader { first_byte, remaining_length }));
                            let remaining_length = remaining_length as usize;
                            if src.len() < remaining_length {
                                src.reserve(remaining_length);
                                return Ok(None);
                            }
                        }
                        None => {
                            return Ok(None);
                        }
                    }
                }
                DecodeState::Frame(fixed) => {
                    if src.len() < fixed.remaining_length as usize {
                        return Ok(None);
                    }
                    let packet_buf = src.split_to(fixed.remaining_length as usize).freeze();
                    let packet = decode_packet(packet_buf, fixed.first_byte)?;
                    self.state.set(DecodeState::FrameHeader);
                    src.reserve(5); // 1 fixed header byte + 4 bytes max variable packet length
                    return Ok(Some((packet, fixed.remaining_length)));
                }
            }
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let max_out_size = self.max_out_size.get();
        let max_size =
            if max_out_size != 0 { max_out_size.min(MAX_PACKET_SIZE) } else { MAX_PACKET_SIZE };
        let content_size = encode::get_encoded_size(&item);
        if content_size > max_size as usize {
            return Err(EncodeError::OverMaxPacketSize);
        }
        dst.reserve(content_size + 5);
        encode::encode(&item, dst, content_size as u32)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v5::PublishAck;
    use std::num::NonZeroU16;

    #[test]
    fn test_max_size() {
        let mut codec = Codec::default();
        codec.set_max_inbound_size(5);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0\x09");
        assert_eq!(codec.decode(&mut buf).map_err(|e| matches!(e, DecodeError::MaxSizeExceeded)), Err(true));
    }

    #[test]
    fn test_round_trip_all_packet_types() {
        use crate::types::{Publish, QoS};
        use crate::v5::{
            Auth, Connect, ConnectAck, Disconnect, LastWill, PublishAck2, Subscribe, SubscribeAck,
            Unsubscribe, UnsubscribeAck,
        };
        use bytes::Bytes;
        use bytestring::ByteString;
        use std::num::NonZeroU16;

        let id = NonZeroU16::new(7).unwrap();
        let props = Bytes::from_static(b"\x26\x00\x01a\x00\x01b");
        let packets = vec![
            Packet::Connect(Box::new(Connect {
                clean_start: true,
                keep_alive: 30,
                properties: props.clone(),
                client_id: ByteString::from_static("client"),
                last_will: Some(LastWill {
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    properties: Bytes::new(),
                    topic: ByteString::from_static("will"),
                    message: Bytes::from_static(b"gone"),
                }),
                username: None,
                password: None,
            })),
            Packet::ConnectAck(ConnectAck::default()),
            Packet::Publish(Publish {
                dup: false,
                retain: false,
                qos: QoS::ExactlyOnce,
                topic: ByteString::from_static("a/b"),
                packet_id: Some(id),
                payload: Bytes::from_static(b"payload"),
                properties: Some(props.clone()),
            }),
            Packet::PublishAck(PublishAck::new(id)),
            Packet::PublishAck(PublishAck { packet_id: id, reason_code: 0x87, properties: props.clone() }),
            Packet::PublishReceived(PublishAck::new(id)),
            Packet::PublishRelease(PublishAck2::new(id)),
            Packet::PublishComplete(PublishAck2::new(id)),
            Packet::Subscribe(Subscribe {
                packet_id: id,
                properties: Bytes::new(),
                topic_filters: vec![(ByteString::from_static("x"), 0x01)],
            }),
            Packet::SubscribeAck(SubscribeAck {
                packet_id: id,
                properties: Bytes::new(),
                status: vec![0x01],
            }),
            Packet::Unsubscribe(Unsubscribe {
                packet_id: id,
                properties: Bytes::new(),
                topic_filters: vec![ByteString::from_static("x")],
            }),
            Packet::UnsubscribeAck(UnsubscribeAck {
                packet_id: id,
                properties: Bytes::new(),
                status: vec![0x00],
            }),
            Packet::PingRequest,
            Packet::PingResponse,
            Packet::Disconnect(Disconnect::default()),
            Packet::Disconnect(Disconnect { reason_code: 0x8e, properties: Bytes::new() }),
            Packet::Auth(Auth { reason_code: 0x18, properties: props }),
        ];

        let mut codec = Codec::default();
        for packet in packets {
            let mut buf = BytesMut::new();
            codec.encode(packet.clone(), &mut buf).unwrap();
            let encoded = buf.clone();

            let (decoded, _) = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, packet);

            let mut buf2 = BytesMut::new();
            codec.encode(decoded, &mut buf2).unwrap();
            assert_eq!(buf2, encoded);
        }
    }

    #[test]
    fn test_short_form_ack_round_trip() {
        let mut codec = Codec::default();
        let mut buf = BytesMut::new();

        let ack = PublishAck::new(NonZeroU16::new(1).unwrap());
        codec.encode(Packet::PublishAck(ack.clone()), &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x40\x02\x00\x01");

        let (decoded, _) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Packet::PublishAck(ack));
    }
}
