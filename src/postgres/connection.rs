// ABOUTME: Connection helpers for PostgreSQL with TLS and retry
// ABOUTME: Builds client configs from URL + service credential and spawns connection drivers

use anyhow::{Context, Result};
use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config};

use crate::utils::{strip_password_from_url, RetryPolicy};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS policy. Only the first call takes effect.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed_certs);
    if allow_self_signed_certs {
        tracing::warn!("TLS certificate verification is disabled (--allow-self-signed-certs)");
    }
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

/// Build the TLS connector used for every connection.
///
/// Whether TLS is actually negotiated follows the `sslmode` in the URL
/// (`prefer` when absent).
pub fn make_tls_connector() -> Result<MakeTlsConnector> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Where and how to reach one store.
///
/// The credential is kept apart from the URL so it never shows up in logs and is
/// applied as the connection password.
#[derive(Clone)]
pub struct ConnectionSpec {
    url: String,
    credential: String,
}

impl ConnectionSpec {
    pub fn new(url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: credential.into(),
        }
    }

    /// URL safe to print (password masked).
    pub fn display_url(&self) -> String {
        strip_password_from_url(&self.url)
    }

    /// Parse the URL into a client config with the credential applied.
    pub fn config(&self) -> Result<Config> {
        let mut config = Config::from_str(&self.url)
            .with_context(|| format!("Invalid connection URL {}", self.display_url()))?;
        if !self.credential.is_empty() {
            config.password(self.credential.as_bytes());
        }
        Ok(config)
    }
}

impl std::fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("url", &self.display_url())
            .field("credential", &"***")
            .finish()
    }
}

/// Open a connection and drive it on a background task.
pub async fn connect(spec: &ConnectionSpec) -> Result<Client> {
    let config = spec.config()?;
    let tls = make_tls_connector()?;
    let (client, connection) = config
        .connect(tls)
        .await
        .with_context(|| format!("Failed to connect to {}", spec.display_url()))?;

    let url = spec.display_url();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection to {} terminated: {}", url, e);
        }
    });

    Ok(client)
}

/// Something that can open a client and tell when that client is dead.
#[async_trait]
pub trait Reconnect: Send + Sync {
    type Client: Send + Sync;

    /// Name for log lines.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Self::Client>;

    fn is_closed(client: &Self::Client) -> bool;
}

#[async_trait]
impl Reconnect for ConnectionSpec {
    type Client = Client;

    fn describe(&self) -> String {
        self.display_url()
    }

    async fn open(&self) -> Result<Client> {
        connect(self).await
    }

    fn is_closed(client: &Client) -> bool {
        client.is_closed()
    }
}

/// A client that is reopened on first use after its connection has dropped.
///
/// A network blip or a database restart ends the connection task, after which
/// every query on the old client fails. Callers fetch the client per operation,
/// so the next attempt after a drop runs on a fresh connection.
pub struct ManagedClient<R: Reconnect = ConnectionSpec> {
    connector: R,
    current: Mutex<Option<Arc<R::Client>>>,
}

impl<R: Reconnect> ManagedClient<R> {
    /// Wrap a client that is already open.
    pub fn new(connector: R, client: R::Client) -> Self {
        Self {
            connector,
            current: Mutex::new(Some(Arc::new(client))),
        }
    }

    /// Open the first client under the retry policy.
    pub async fn connect(connector: R, policy: &RetryPolicy) -> Result<Self> {
        let label = format!("connect {}", connector.describe());
        let client = policy.run(&label, || connector.open()).await?;
        Ok(Self::new(connector, client))
    }

    pub fn connector(&self) -> &R {
        &self.connector
    }

    /// The live client, reconnecting first if the previous one is closed.
    ///
    /// A failed reconnect is returned to the caller and tried again on the next call.
    pub async fn get(&self) -> Result<Arc<R::Client>> {
        let mut current = self.current.lock().await;
        if let Some(client) = current.as_ref() {
            if !R::is_closed(client) {
                return Ok(Arc::clone(client));
            }
            tracing::warn!(
                "Connection to {} was closed, reconnecting",
                self.connector.describe()
            );
            *current = None;
        }

        let client = Arc::new(
            self.connector
                .open()
                .await
                .with_context(|| format!("Failed to reconnect to {}", self.connector.describe()))?,
        );
        tracing::info!("Reconnected to {}", self.connector.describe());
        *current = Some(Arc::clone(&client));
        Ok(client)
    }
}
