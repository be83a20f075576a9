// ABOUTME: PostgreSQL connection establishment with TLS and retry
// ABOUTME: Holds the process-wide TLS policy and spawns connection drivers

use std::sync::OnceLock;
use std::time::Duration;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::Client;

use crate::error::{Result, SyncError};
use crate::utils::{retry_with_backoff, strip_password_from_url};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the TLS certificate policy once at startup.
///
/// Later calls are ignored; the first value wins.
pub fn init_tls_policy(allow_self_signed: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed);
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

fn tls_connector() -> Result<MakeTlsConnector> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .build()?;
    Ok(MakeTlsConnector::new(connector))
}

/// Connect to PostgreSQL and spawn the connection driver.
///
/// The driver task logs and exits when the connection closes; the returned
/// client reports `is_closed()` from then on.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = tls_connector()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .map_err(|e| SyncError::connection(strip_password_from_url(url), e.to_string()))?;

    let display_url = strip_password_from_url(url);
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection to {} closed with error: {}", display_url, e);
        }
    });

    Ok(client)
}

/// Connect with exponential backoff (3 retries starting at 1s).
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}
