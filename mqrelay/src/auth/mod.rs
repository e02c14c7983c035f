use async_trait::async_trait;

use crate::Result;

mod instrument;
mod plain;

pub use instrument::InstrumentedAuthenticator;
pub use plain::PlainAuthenticator;

/// CONNECT return code produced by a login attempt, in 3.1.1 numbering.
/// The handler remaps to the MQTT 5 equivalents where needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Accepted,
    RefusedBadUserNameOrPassword,
    RefusedNotAuthorized,
}

impl ReturnCode {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            ReturnCode::Accepted => 0,
            ReturnCode::RefusedBadUserNameOrPassword => 4,
            ReturnCode::RefusedNotAuthorized => 5,
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, ReturnCode::Accepted)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Username/password check invoked for every CONNECT. A returned code is
/// passed through to the CONNACK; an `Err` closes the connection without
/// a CONNACK.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn login(&self, request: &LoginRequest) -> Result<ReturnCode>;
}

/// Accepts everyone.
pub struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn login(&self, _request: &LoginRequest) -> Result<ReturnCode> {
        Ok(ReturnCode::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_accepts_anyone() {
        let auth = NoopAuthenticator;
        let code = auth
            .login(&LoginRequest { username: "any".into(), password: "thing".into() })
            .await
            .unwrap();
        assert_eq!(code, ReturnCode::Accepted);
    }
}
