use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::{Error, Result};

/// How much of an error body ends up in an error message.
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client shared by every outbound integration.
///
/// Per-request timeouts are set by the callers; `request_timeout` is the
/// ceiling for anything that does not set one.
pub fn build_http_client(
    request_timeout: Duration,
    pool_max_idle_per_host: usize,
) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("reelforge/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30));

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }
    if pool_max_idle_per_host > 0 {
        builder = builder.pool_max_idle_per_host(pool_max_idle_per_host);
    }

    Ok(builder.build()?)
}

/// Pass successful responses through; turn anything else into a
/// [`Error::Provider`] carrying the status and the start of the body.
pub async fn ensure_success(
    provider: &str,
    context: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::provider(
        provider,
        format!(
            "{context} {}: {}",
            status.as_u16(),
            preview(&body, ERROR_BODY_PREVIEW_CHARS)
        ),
    ))
}

/// First `max_chars` characters of `s`.
pub fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
