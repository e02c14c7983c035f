use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

use mqrelay_codec::error::DecodeError;
use mqrelay_codec::v3::Codec as CodecV3;
use mqrelay_codec::v5::Codec as CodecV5;
use mqrelay_codec::version::{
    ProtocolVersion, VersionCodec, UNACCEPTABLE_PROTOCOL_CONNACK,
};
use mqrelay_codec::{MqttCodec, MqttPacket};

use crate::error::MqttError;
use crate::{Builder, Result};

/// Object-safe socket trait so TCP and TLS connections flow through one
/// concrete stream type.
pub trait MqttIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> MqttIo for T {}

pub type BoxedIo = Box<dyn MqttIo>;

/// Accepted connection before the protocol version is known.
pub struct Dispatcher {
    pub(crate) io: Framed<BoxedIo, MqttCodec>,
    pub remote_addr: SocketAddr,
    pub tls: bool,
    pub cfg: Arc<Builder>,
}

impl Dispatcher {
    pub(crate) fn new(io: BoxedIo, remote_addr: SocketAddr, tls: bool, cfg: Arc<Builder>) -> Self {
        let mut io =
            Framed::with_capacity(io, MqttCodec::Version(VersionCodec), cfg.reader_buffer_size);
        io.write_buffer_mut().reserve(cfg.writer_buffer_size);
        Dispatcher { io, remote_addr, tls, cfg }
    }

    /// Determines the protocol version from the buffered CONNECT bytes and
    /// swaps in the version-specific codec; the buffered bytes are then
    /// replayed by the first real `recv`. A CONNECT with an unacceptable
    /// protocol level is answered with a negative CONNACK before the error
    /// is returned.
    #[inline]
    pub async fn mqtt(mut self) -> Result<MqttStream> {
        let version = match self.probe_version().await {
            Ok(version) => version,
            Err(e)
                if matches!(
                    e.downcast_ref::<DecodeError>(),
                    Some(DecodeError::UnsupportedProtocolLevel)
                ) =>
            {
                let io = self.io.get_mut();
                let _ = io.write_all(&UNACCEPTABLE_PROTOCOL_CONNACK).await;
                let _ = io.flush().await;
                return Err(MqttError::UnsupportedProtocolVersion.into());
            }
            Err(e) => return Err(e),
        };

        let codec = match version {
            ProtocolVersion::MQTT3 => MqttCodec::V3(CodecV3::new(self.cfg.max_packet_size)),
            ProtocolVersion::MQTT5 => {
                MqttCodec::V5(CodecV5::new(self.cfg.max_packet_size, self.cfg.max_packet_size))
            }
        };
        *self.io.codec_mut() = codec;

        Ok(MqttStream {
            io: self.io,
            version,
            remote_addr: self.remote_addr,
            tls: self.tls,
            cfg: self.cfg,
        })
    }

    #[inline]
    async fn probe_version(&mut self) -> Result<ProtocolVersion> {
        match tokio::time::timeout(self.cfg.read_timeout, self.io.next()).await {
            Ok(Some(Ok((MqttPacket::Version(ver), _)))) => Ok(ver),
            Ok(Some(Ok(_))) => Err(anyhow!(DecodeError::InvalidProtocol)),
            Ok(Some(Err(e))) => Err(anyhow!(e)),
            Ok(None) => Err(anyhow!(DecodeError::InvalidProtocol)),
            Err(_) => Err(MqttError::ReadTimeout.into()),
        }
    }
}

/// Version-negotiated packet stream.
pub struct MqttStream {
    pub io: Framed<BoxedIo, MqttCodec>,
    pub version: ProtocolVersion,
    pub remote_addr: SocketAddr,
    pub tls: bool,
    pub cfg: Arc<Builder>,
}

impl MqttStream {
    /// Receives the next packet, bounded by `tm` when non-zero.
    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<MqttPacket>> {
        if tm.is_zero() {
            return match self.io.next().await {
                Some(Ok((packet, _))) => Ok(Some(packet)),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            };
        }
        match tokio::time::timeout(tm, self.io.next()).await {
            Ok(Some(Ok((packet, _)))) => Ok(Some(packet)),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Ok(None),
            Err(_) => Err(MqttError::ReadTimeout.into()),
        }
    }

    /// Sends one packet and flushes, bounded by the configured send timeout.
    #[inline]
    pub async fn send(&mut self, packet: MqttPacket) -> Result<()> {
        send(&mut self.io, packet, self.cfg.send_timeout).await
    }

    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        close(&mut self.io, self.cfg.send_timeout).await
    }
}

#[inline]
pub(crate) async fn send(
    io: &mut Framed<BoxedIo, MqttCodec>,
    packet: MqttPacket,
    send_timeout: Duration,
) -> Result<()> {
    if send_timeout.is_zero() {
        io.send(packet).await?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::Encode(e)),
            Err(_) => Err(MqttError::WriteTimeout),
        }?;
        Ok(())
    }
}

#[inline]
pub(crate) async fn close(
    io: &mut Framed<BoxedIo, MqttCodec>,
    send_timeout: Duration,
) -> Result<()> {
    if send_timeout.is_zero() {
        io.close().await?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::Encode(e)),
            Err(_) => Err(MqttError::CloseTimeout),
        }?;
        Ok(())
    }
}
