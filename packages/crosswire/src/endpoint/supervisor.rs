//! Endpoint Supervisor
//!
//! Binds every configured endpoint up front (so ports are known before any
//! client connects), then serves them side by side. Each endpoint owns its
//! own registry; the relay and metrics are shared.

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{EndpointConfig, ServerConfig};
use crate::metrics::ServerMetrics;
use crate::protocol::EndpointId;
use crate::registry::{Registries, Registry};
use crate::relay::Relay;

use super::{EndpointContext, app};

/// Time allowed for in-flight TLS connections to finish on shutdown.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A listening socket with its registry, not yet serving.
pub struct BoundEndpoint {
    listener: TcpListener,
    tls: Option<RustlsConfig>,
    registry: Registry,
}

impl BoundEndpoint {
    /// Bind one endpoint. Port 0 picks a free port; the endpoint ID is the
    /// port actually bound.
    pub async fn bind(host: &str, config: &EndpointConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", host, config.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, config.port))?;

        let tls = match &config.tls {
            Some(paths) => Some(
                RustlsConfig::from_pem_file(&paths.cert_path, &paths.key_path)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to load TLS certificate {} / key {}",
                            paths.cert_path.display(),
                            paths.key_path.display()
                        )
                    })?,
            ),
            None => None,
        };

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            listener,
            tls,
            registry: Registry::new(port),
        })
    }

    pub fn id(&self) -> EndpointId {
        self.registry.endpoint()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

/// Bind every endpoint in `config`, failing on the first that cannot bind.
pub async fn bind_all(config: &ServerConfig) -> Result<Vec<BoundEndpoint>> {
    let mut bound = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        bound.push(BoundEndpoint::bind(&config.host, endpoint).await?);
    }
    Ok(bound)
}

pub struct Supervisor {
    endpoints: Vec<BoundEndpoint>,
    relay: Arc<Relay>,
    metrics: Arc<ServerMetrics>,
    outbound_queue: usize,
}

impl Supervisor {
    pub fn new(
        endpoints: Vec<BoundEndpoint>,
        relay: Arc<Relay>,
        metrics: Arc<ServerMetrics>,
        outbound_queue: usize,
    ) -> Self {
        Self {
            endpoints,
            relay,
            metrics,
            outbound_queue,
        }
    }

    /// Registries of `endpoints`, for building the relay that serves them.
    pub fn registries(endpoints: &[BoundEndpoint]) -> Registries {
        Registries::new(endpoints.iter().map(|e| e.registry.clone()).collect())
    }

    /// Serve every endpoint until `cancel` fires. An endpoint that stops with
    /// an error is logged; the others keep running.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        for endpoint in self.endpoints {
            let ctx = EndpointContext {
                registry: endpoint.registry.clone(),
                relay: self.relay.clone(),
                metrics: self.metrics.clone(),
                outbound_queue: self.outbound_queue,
            };
            let id = endpoint.id();
            let cancel = cancel.clone();
            tasks.spawn(async move { (id, serve(endpoint, ctx, cancel).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => info!(endpoint = id, "endpoint stopped"),
                Ok((id, Err(e))) => error!(endpoint = id, "endpoint failed: {:#}", e),
                Err(e) => error!("endpoint task panicked: {}", e),
            }
        }
        Ok(())
    }
}

async fn serve(endpoint: BoundEndpoint, ctx: EndpointContext, cancel: CancellationToken) -> Result<()> {
    let id = endpoint.id();
    let app = app(ctx);

    match endpoint.tls {
        None => {
            info!("WebSocket server running on ws://{}", endpoint.listener.local_addr()?);
            axum::serve(endpoint.listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .with_context(|| format!("server error on endpoint {}", id))
        }
        Some(tls) => {
            let addr = endpoint.listener.local_addr()?;
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                shutdown.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
            });

            info!("WebSocket server running on wss://{}", addr);
            let listener = endpoint.listener.into_std()?;
            axum_server::from_tcp_rustls(listener, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .with_context(|| format!("server error on endpoint {}", id))
        }
    }
}
