use mqrelay_codec::error::{DecodeError, EncodeError};

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// MQTT decoding error
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    /// MQTT encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Write timeout
    #[error("Write timeout")]
    WriteTimeout,
    /// Flush timeout
    #[error("Flush timeout")]
    FlushTimeout,
    /// Close timeout
    #[error("Close timeout")]
    CloseTimeout,
    /// The peer asked for a protocol level other than 4 or 5; a negative
    /// CONNACK has already been written when this is returned from the
    /// version probe.
    #[error("Unsupported protocol version")]
    UnsupportedProtocolVersion,
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("service unavailable")]
    ServiceUnavailable,
}
