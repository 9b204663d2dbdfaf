//! Encoding of [ParamSet]s into URLs and back.
//!
//! Producers put a single `psicash=<payload>` parameter into the hash (optionally prefixed
//! with `!`) or the query string. The payload is base64-encoded JSON, or plain
//! (URI-encoded) JSON from older producers.

use crate::{params::Freshness, ParamSet, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};
use url::Url;

/// Returns the raw components searched for params, in precedence order: hash, then query.
fn param_locations(url: &Url) -> [&str; 2] {
    let hash = url.fragment().unwrap_or_default();
    let hash = hash.strip_prefix('!').unwrap_or(hash);
    [hash, url.query().unwrap_or_default()]
}

/// Gets the value for `name` from the URL hash or query, percent-decoded.
///
/// Unlike form decoding, `+` is left alone (it is part of the base64 alphabet).
/// Returns `None` if the URL is unparseable or the param is missing or empty.
pub fn url_param(url: &str, name: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    for location in param_locations(&parsed) {
        let found = location.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name && !value.is_empty()).then_some(value)
        });
        if let Some(raw) = found {
            return Some(percent_decode_str(raw).decode_utf8_lossy().into_owned());
        }
    }
    None
}

/// Decodes a payload that is either base64 JSON or plain JSON.
pub fn decode_payload(payload: &str) -> Result<ParamSet> {
    let json = match general_purpose::STANDARD
        .decode(payload)
        .or_else(|_| general_purpose::URL_SAFE.decode(payload))
    {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        // Not base64, so it should already be JSON
        Err(_) => payload.to_string(),
    };
    Ok(serde_json::from_str(&json)?)
}

/// Extracts and validates the params carried by `url`.
///
/// Returns `None` when the param is missing, cannot be decoded, or fails the freshness
/// check. Problems are logged, never raised.
pub fn decode_from_url(url: &str, now: DateTime<Utc>, freshness: &Freshness) -> Option<ParamSet> {
    let payload = url_param(url, crate::PSICASH_URL_PARAM)?;
    let params = match decode_payload(&payload) {
        Ok(params) => params,
        Err(err) => {
            warn!(error = %err, "failed to decode URL params");
            return None;
        }
    };
    if let Err(err) = params.check_freshness(now, freshness) {
        warn!(error = %err, "rejecting URL params");
        return None;
    }
    debug!(timestamp = ?params.timestamp, "decoded URL params");
    Some(params)
}

/// Encodes params for embedding in a URL: JSON, then standard base64.
pub fn encode(params: &ParamSet) -> Result<String> {
    let json = serde_json::to_string(params)?;
    Ok(general_purpose::STANDARD.encode(json))
}

/// Strips the query and fragment from a URL, leaving origin and path.
pub fn strip_query_and_fragment(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url)?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.into())
}
