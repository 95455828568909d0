//! gRPC client for the backend relay service
//!
//! This module provides:
//! - The [`RelayTransport`] seam the streaming session talks through
//! - [`SyncClient`], the tonic implementation with optional mTLS
//! - Lazy channel creation, dropped and rebuilt after a failure

use crate::error::{RelayError, RelayResult};
use crate::proto::{
    ClusterRelayServiceClient, Envelope, InitBackendRequest, InitBackendResponse, StreamAck,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::{debug, info, warn};

/// Acknowledgements flowing back from the peer
pub type AckStream = Pin<Box<dyn Stream<Item = Result<StreamAck, tonic::Status>> + Send>>;

/// Transport used by a streaming session
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Register this agent with the backend
    async fn init_backend(&self, request: InitBackendRequest) -> RelayResult<InitBackendResponse>;

    /// Open the bidirectional stream; envelopes pushed into `outbound`
    /// are written to the peer until the sender side is dropped
    async fn open_stream(&self, outbound: mpsc::Receiver<Envelope>) -> RelayResult<AckStream>;
}

/// Configuration for the gRPC client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend endpoint URL (e.g., "https://relay-backend:8443")
    pub endpoint: String,
    /// CA certificate for server verification; TLS is used when set
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mTLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key for mTLS
    pub client_key_path: Option<PathBuf>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout for unary requests; the stream itself is unbounded
    pub request_timeout: Duration,
    /// Keepalive interval
    pub keepalive_interval: Duration,
    /// Keepalive timeout
    pub keepalive_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://relay-backend:8080".to_string(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

/// gRPC client for the relay backend
pub struct SyncClient {
    config: ClientConfig,
    channel: Arc<RwLock<Option<Channel>>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            channel: Arc::new(RwLock::new(None)),
        }
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn tls_enabled(&self) -> bool {
        self.config.ca_cert_path.is_some()
    }

    /// Load TLS configuration from certificate files
    async fn load_tls_config(&self) -> Result<ClientTlsConfig> {
        let mut tls_config = ClientTlsConfig::new().domain_name(self.extract_domain()?);

        if let Some(ca_path) = &self.config.ca_cert_path {
            let ca_cert = tokio::fs::read(ca_path)
                .await
                .with_context(|| format!("Failed to read CA certificate from {:?}", ca_path))?;
            tls_config = tls_config.ca_certificate(Certificate::from_pem(ca_cert));
        }

        if let (Some(cert_path), Some(key_path)) =
            (&self.config.client_cert_path, &self.config.client_key_path)
        {
            let client_cert = tokio::fs::read(cert_path).await.with_context(|| {
                format!("Failed to read client certificate from {:?}", cert_path)
            })?;
            let client_key = tokio::fs::read(key_path)
                .await
                .with_context(|| format!("Failed to read client key from {:?}", key_path))?;
            tls_config = tls_config.identity(Identity::from_pem(client_cert, client_key));
        }

        Ok(tls_config)
    }

    /// Extract domain name from endpoint URL
    fn extract_domain(&self) -> Result<String> {
        let url = url::Url::parse(&self.config.endpoint)
            .with_context(|| format!("Invalid endpoint URL: {}", self.config.endpoint))?;
        url.host_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("No host in endpoint URL"))
    }

    /// Create a new gRPC channel
    async fn create_channel(&self) -> Result<Channel> {
        let mut endpoint = Channel::from_shared(self.config.endpoint.clone())
            .with_context(|| format!("Invalid endpoint URL: {}", self.config.endpoint))?
            .connect_timeout(self.config.connect_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_timeout(self.config.keepalive_timeout)
            .keep_alive_while_idle(true);

        if self.tls_enabled() {
            let tls_config = self.load_tls_config().await?;
            endpoint = endpoint
                .tls_config(tls_config)
                .context("Failed to apply TLS configuration")?;
        }

        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.endpoint))?;

        Ok(channel)
    }

    /// Get or create a connected channel
    async fn get_channel(&self) -> Result<Channel> {
        {
            let channel = self.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                return Ok(ch.clone());
            }
        }

        let new_channel = self.create_channel().await?;
        let mut channel = self.channel.write().await;
        *channel = Some(new_channel.clone());

        info!(
            endpoint = %self.config.endpoint,
            tls = self.tls_enabled(),
            "Connected to relay backend"
        );

        Ok(new_channel)
    }

    /// Forget the current channel so the next call reconnects
    async fn handle_connection_failure(&self, error: &str) {
        let mut channel = self.channel.write().await;
        *channel = None;

        warn!(
            endpoint = %self.config.endpoint,
            error = %error,
            "Connection to relay backend failed"
        );
    }

    async fn client(&self) -> RelayResult<ClusterRelayServiceClient<Channel>> {
        match self.get_channel().await {
            Ok(channel) => Ok(ClusterRelayServiceClient::new(channel)),
            Err(e) => {
                let message = format!("{:#}", e);
                self.handle_connection_failure(&message).await;
                Err(RelayError::Transport(message))
            }
        }
    }

    /// Disconnect from the backend
    pub async fn disconnect(&self) {
        let mut channel = self.channel.write().await;
        *channel = None;
        debug!("Disconnected from relay backend");
    }
}

#[async_trait]
impl RelayTransport for SyncClient {
    async fn init_backend(&self, request: InitBackendRequest) -> RelayResult<InitBackendResponse> {
        let mut client = self.client().await?;

        let mut request = tonic::Request::new(request);
        request.set_timeout(self.config.request_timeout);

        match client.init_backend(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.handle_connection_failure(status.message()).await;
                Err(RelayError::PeerStream(status))
            }
        }
    }

    async fn open_stream(&self, outbound: mpsc::Receiver<Envelope>) -> RelayResult<AckStream> {
        let mut client = self.client().await?;

        match client.stream_updates(ReceiverStream::new(outbound)).await {
            Ok(response) => Ok(Box::pin(response.into_inner())),
            Err(status) => {
                self.handle_connection_failure(status.message()).await;
                Err(RelayError::PeerStream(status))
            }
        }
    }
}

/// Builder for SyncClient configuration
pub struct SyncClientBuilder {
    config: ClientConfig,
}

impl SyncClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.client_key_path = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keepalive_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<SyncClient> {
        url::Url::parse(&self.config.endpoint)
            .with_context(|| format!("Invalid endpoint URL: {}", self.config.endpoint))?;
        if self.config.client_cert_path.is_some() != self.config.client_key_path.is_some() {
            anyhow::bail!("client certificate and key must be configured together");
        }
        Ok(SyncClient::new(self.config))
    }
}

impl Default for SyncClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
