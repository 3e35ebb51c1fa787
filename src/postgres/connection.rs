// ABOUTME: PostgreSQL connection management with TLS and retries
// ABOUTME: Every session pins the settings that make value rendering deterministic

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, strip_password_from_url};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Session settings applied right after connecting.
///
/// Values are compared by their text rendering, so both databases must
/// render timestamps, intervals, floats and bytea the same way.
pub const SESSION_SETTINGS: &str = "SET TimeZone = 'UTC'; \
     SET DateStyle = 'ISO, MDY'; \
     SET IntervalStyle = 'postgres'; \
     SET extra_float_digits = 3; \
     SET bytea_output = 'hex'";

/// Set the process-wide TLS policy. Only the first call has an effect.
pub fn init_tls_policy(allow_self_signed: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed).is_err() {
        tracing::debug!("TLS policy already initialized, keeping the first setting");
    }
    if allow_self_signed {
        tracing::warn!("Accepting self-signed TLS certificates. Use this only for testing");
    }
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

fn make_tls_connector() -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if allow_self_signed() {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Connect once, spawn the connection task and apply [`SESSION_SETTINGS`].
pub async fn connect(url: &str) -> Result<Client> {
    let display_url = strip_password_from_url(url).unwrap_or_else(|_| "<invalid url>".to_string());
    let tls = make_tls_connector()?;

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", display_url))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    client
        .batch_execute(SESSION_SETTINGS)
        .await
        .with_context(|| format!("Failed to apply session settings on {}", display_url))?;

    Ok(client)
}

/// Connect with up to three retries, doubling the delay from one second.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

/// Round-trip a trivial query to prove the connection is usable.
pub async fn ping(client: &Client) -> Result<()> {
    client
        .simple_query("SELECT 1")
        .await
        .context("Ping query failed")?;
    Ok(())
}
