#![deny(unsafe_code)]

mod builder;
mod cert;
mod error;
mod stream;

pub use builder::{Acceptor, Builder, Listener, TlsListener};
pub use cert::{CertBundle, FileCertSource};
pub use error::MqttError;
pub use rustls;
pub use stream::{BoxedIo, Dispatcher, MqttIo, MqttStream};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
