use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use prometheus::HistogramVec;

use super::{Authenticator, LoginRequest, ReturnCode};
use crate::metrics::Metrics;
use crate::Result;

/// Wraps an authenticator and records login latency by return code and
/// transport-error flag.
pub struct InstrumentedAuthenticator {
    delegate: Arc<dyn Authenticator>,
    login_duration: HistogramVec,
}

impl InstrumentedAuthenticator {
    pub fn new(delegate: Arc<dyn Authenticator>, metrics: &Metrics) -> Result<Self> {
        let login_duration = metrics.login_duration(delegate.name())?;
        Ok(Self { delegate, login_duration })
    }
}

#[async_trait]
impl Authenticator for InstrumentedAuthenticator {
    fn name(&self) -> &'static str {
        self.delegate.name()
    }

    async fn login(&self, request: &LoginRequest) -> Result<ReturnCode> {
        let start = Instant::now();
        let result = self.delegate.login(request).await;
        let (code, is_error) = match &result {
            Ok(code) => (code.value().to_string(), "0"),
            Err(_) => (String::new(), "1"),
        };
        self.login_duration
            .with_label_values(&[code.as_str(), is_error])
            .observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoopAuthenticator;

    #[tokio::test]
    async fn test_records_login_duration() {
        let metrics = Metrics::new().unwrap();
        let auth =
            InstrumentedAuthenticator::new(Arc::new(NoopAuthenticator), &metrics).unwrap();

        let code = auth.login(&LoginRequest::default()).await.unwrap();
        assert_eq!(code, ReturnCode::Accepted);
        assert_eq!(auth.login_duration.with_label_values(&["0", "0"]).get_sample_count(), 1);
    }
}
