//! Server URL derivation shared by the REST client and the chat socket.
//!
//! The configured base may be absolute (`https://pilot.example.com/api`) or
//! relative to the page origin (`/api`). Embedded deployments ignore the
//! configured base and talk to the origin they are served from.

use anyhow::{Context, Result, bail};
use url::Url;

pub const BASE_URL_ENV: &str = "PILOT_BASE_URL";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Where the client runs, as far as URL derivation cares.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deployment<'a> {
    pub base_url: Option<&'a str>,
    pub origin: Option<&'a str>,
    pub embedded: bool,
}

/// Resolves the base URL: `PILOT_BASE_URL` env var, then config, then default.
pub fn resolve_base_url(config_base_url: Option<&str>) -> String {
    if let Ok(env_url) = std::env::var(BASE_URL_ENV) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    config_base_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .unwrap_or(DEFAULT_BASE_URL)
        .to_string()
}

/// Normalized HTTP(S) base URL, always ending in `/`.
///
/// # Errors
/// Returns an error if a required origin is missing, a URL does not parse,
/// or the scheme is not http/https.
pub fn http_base(deployment: &Deployment<'_>) -> Result<Url> {
    let mut url = if deployment.embedded {
        let origin = deployment
            .origin
            .context("Embedded mode requires a page origin")?;
        Url::parse(origin).with_context(|| format!("Invalid origin: {origin}"))?
    } else {
        let base = deployment.base_url.unwrap_or(DEFAULT_BASE_URL).trim();
        match Url::parse(base) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let origin = deployment.origin.with_context(|| {
                    format!("Relative base URL '{base}' requires a page origin")
                })?;
                Url::parse(origin)
                    .with_context(|| format!("Invalid origin: {origin}"))?
                    .join(base)
                    .with_context(|| format!("Invalid base URL: {base}"))?
            }
            Err(e) => return Err(e).with_context(|| format!("Invalid base URL: {base}")),
        }
    };

    if !matches!(url.scheme(), "http" | "https") {
        bail!("Unsupported base URL scheme '{}' in {url}", url.scheme());
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Chat socket endpoint: `ws(s)://{base}/ws/chat?sessionCode=..&token=..`.
///
/// # Errors
/// Returns an error if the base cannot be joined or switched to a ws scheme.
pub fn chat_socket_url(base: &Url, session_code: &str, token: &str) -> Result<Url> {
    let mut url = base.join("ws/chat").context("Failed to build chat socket URL")?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    if url.set_scheme(scheme).is_err() {
        bail!("Cannot use {scheme} scheme for {url}");
    }
    url.query_pairs_mut()
        .append_pair("sessionCode", session_code)
        .append_pair("token", token);
    Ok(url)
}
