//! Signaling URL derivation

use super::error::ConfigurationError;
use url::Url;

/// Maps `http(s)://host[/path]` to `ws(s)://host[/path]/websocket?token=<token>`.
pub fn channel_url(base_url: &str, token: &str) -> Result<Url, ConfigurationError> {
    if token.is_empty() {
        return Err(ConfigurationError::MissingToken);
    }

    let mut url =
        Url::parse(base_url).map_err(|e| ConfigurationError::InvalidBaseUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigurationError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConfigurationError::InvalidBaseUrl(base_url.to_string()))?;

    let path = format!("{}/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut().clear().append_pair("token", token);

    Ok(url)
}
