// ABOUTME: PostgreSQL connection handling for the destination
// ABOUTME: Applies the fetched password, TLS via native-tls and retrying connects

use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

use crate::config::DestinationConfig;
use crate::utils::{retry_with_backoff, sanitize_url};

/// Everything needed to open a destination connection.
///
/// The password lives only here, in memory; `Debug` never prints it.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub url: String,
    password: Option<String>,
    pub allow_self_signed_certs: bool,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("url", &sanitize_url(&self.url))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("allow_self_signed_certs", &self.allow_self_signed_certs)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            allow_self_signed_certs: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(destination: &DestinationConfig, password: Option<String>) -> Self {
        Self {
            url: destination.url.clone(),
            password,
            allow_self_signed_certs: destination.allow_self_signed_certs,
            connect_timeout: Duration::from_secs(destination.connect_timeout_secs),
        }
    }

    /// Connection URL with any embedded password masked.
    pub fn display_url(&self) -> String {
        sanitize_url(&self.url)
    }

    fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let mut config: tokio_postgres::Config = self
            .url
            .parse()
            .with_context(|| format!("Invalid PostgreSQL URL {}", self.display_url()))?;
        if let Some(password) = &self.password {
            config.password(password);
        }
        config.connect_timeout(self.connect_timeout);
        config.application_name("tosh-sync");
        Ok(config)
    }
}

/// Open one connection and drive it on a background task.
pub async fn connect(settings: &ConnectionSettings) -> Result<Client> {
    let config = settings.pg_config()?;
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(settings.allow_self_signed_certs)
        .build()
        .context("Failed to build TLS connector")?;
    let connector = MakeTlsConnector::new(tls);

    let (client, connection) = config
        .connect(connector)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.display_url()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!("PostgreSQL connection closed with error: {}", e);
        }
    });

    tracing::debug!("Connected to {}", settings.display_url());
    Ok(client)
}

/// [`connect`] with three retries starting at one second.
pub async fn connect_with_retry(settings: &ConnectionSettings) -> Result<Client> {
    retry_with_backoff(|| connect(settings), 3, Duration::from_secs(1)).await
}
