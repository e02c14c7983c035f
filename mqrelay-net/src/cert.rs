use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rustls::crypto::aws_lc_rs as provider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::Result;

/// One loaded certificate generation: server chain and key, optional client
/// CA roots, optional client CRLs, and a checksum of the source files used
/// to skip no-op reloads.
pub struct CertBundle {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub client_cas: Vec<CertificateDer<'static>>,
    pub crls: Vec<CertificateRevocationListDer<'static>>,
    pub checksum: u64,
}

impl CertBundle {
    /// Builds the rustls server config for this generation. When client CAs
    /// are configured the verifier requires client certificates, and any
    /// configured CRLs are enforced during chain verification, rejecting
    /// handshakes whose leaf serial is listed.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let provider = Arc::new(provider::default_provider());

        let client_auth = if self.client_cas.is_empty() {
            WebPkiClientVerifier::no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            for ca in &self.client_cas {
                roots.add(ca.clone()).map_err(|e| anyhow!(e))?;
            }
            WebPkiClientVerifier::builder_with_provider(roots.into(), provider.clone())
                .with_crls(self.crls.iter().cloned())
                .build()
                .map_err(|e| anyhow!(e))?
        };

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!(e))?
            .with_client_cert_verifier(client_auth)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| anyhow!(format!("bad certs/private key, {}", e)))?;
        Ok(config)
    }
}

/// File-backed certificate source with periodic refresh.
#[derive(Clone, Debug)]
pub struct FileCertSource {
    pub cert: String,
    pub key: String,
    pub client_ca: Option<String>,
    pub client_crl: Option<String>,
    pub refresh: Duration,
}

impl FileCertSource {
    pub fn load(&self) -> Result<CertBundle> {
        let mut hasher = DefaultHasher::new();

        let cert_bytes = std::fs::read(&self.cert)?;
        hasher.write(&cert_bytes);
        let cert_chain = CertificateDer::pem_slice_iter(&cert_bytes)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!(e))?;

        let key_bytes = std::fs::read(&self.key)?;
        hasher.write(&key_bytes);
        let key = PrivateKeyDer::from_pem_slice(&key_bytes).map_err(|e| anyhow!(e))?;

        let client_cas = if let Some(ca) = self.client_ca.as_ref() {
            let ca_bytes = std::fs::read(ca)?;
            hasher.write(&ca_bytes);
            CertificateDer::pem_slice_iter(&ca_bytes)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| anyhow!(e))?
        } else {
            Vec::new()
        };

        let crls = if let Some(crl) = self.client_crl.as_ref() {
            let crl_bytes = std::fs::read(crl)?;
            hasher.write(&crl_bytes);
            CertificateRevocationListDer::pem_slice_iter(&crl_bytes)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| anyhow!(e))?
        } else {
            Vec::new()
        };

        Ok(CertBundle { cert_chain, key, client_cas, crls, checksum: hasher.finish() })
    }

    /// Loads the initial generation and, when a refresh interval is set,
    /// spawns a task that re-reads the files on that interval and pushes a
    /// rebuilt acceptor over the returned channel. A refresh failure keeps
    /// the previous generation in service.
    pub fn spawn(self) -> Result<watch::Receiver<TlsAcceptor>> {
        let bundle = self.load()?;
        let acceptor = TlsAcceptor::from(Arc::new(bundle.server_config()?));
        let (tx, rx) = watch::channel(acceptor);

        if !self.refresh.is_zero() {
            let mut checksum = bundle.checksum;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(self.refresh);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match self.load() {
                        Ok(bundle) if bundle.checksum == checksum => {}
                        Ok(bundle) => match bundle.server_config() {
                            Ok(config) => {
                                checksum = bundle.checksum;
                                log::info!(
                                    "reloaded server certificate, checksum: {:x}",
                                    bundle.checksum
                                );
                                if tx.send(TlsAcceptor::from(Arc::new(config))).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                log::error!("rebuilding TLS config failed, {:?}", e);
                            }
                        },
                        Err(e) => {
                            log::error!("reloading certificates failed, {:?}", e);
                        }
                    }
                }
            });
        }
        Ok(rx)
    }
}
