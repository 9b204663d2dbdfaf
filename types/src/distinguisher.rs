//! Validation of distinguishers: the page identity a reward transaction is claimed for.
//!
//! A distinguisher is `host` or `host/path/prefix`. It is only valid for a page whose
//! referrer has exactly that host and, when the referrer carries a path, a path that
//! starts with the distinguisher's path.

use url::Url;

/// Returns the host of a URL, with the port only when it is not the scheme default.
pub fn host(url: &Url) -> Option<String> {
    let hostname = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{hostname}:{port}"),
        None => hostname.to_string(),
    })
}

/// Returns the host of a URL string. See [host].
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok().as_ref().and_then(host)
}

/// Splits a distinguisher into its host and (possibly empty) path prefix.
fn split(distinguisher: &str) -> Option<(&str, &str)> {
    let split_at = distinguisher.find('/').unwrap_or(distinguisher.len());
    let (host, path) = distinguisher.split_at(split_at);
    (!host.is_empty()).then_some((host, path))
}

/// Checks if `distinguisher` may be claimed by the page at `referrer`.
///
/// The host comparison is exact, so `example.com` is never valid for
/// `example.com.attacker.net`. Origin-only referrers (path `/`) can only be checked by host;
/// some browsers never send more than that cross-origin.
pub fn validate(distinguisher: &str, referrer: &Url) -> bool {
    let Some((distinguisher_host, distinguisher_path)) = split(distinguisher) else {
        return false;
    };
    let Some(referrer_host) = host(referrer) else {
        return false;
    };
    if referrer_host != distinguisher_host {
        return false;
    }

    let referrer_path = referrer.path();
    if referrer_path == "/" || referrer_path.is_empty() {
        return true;
    }
    referrer_path.starts_with(distinguisher_path)
}
