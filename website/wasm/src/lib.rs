//! Browser bindings for the PsiCash param codec and distinguisher rules.
//!
//! Lets the page and iframe scripts share one implementation of param encoding,
//! freshness checks, and storage key naming with the native widget.

use chrono::{DateTime, Utc};
use psicash_types::{codec, distinguisher, newest, Freshness, ParamSet};
use serde::Serialize;
use serde_wasm_bindgen::Serializer;
use wasm_bindgen::prelude::*;

/// Helper to convert params to a plain JavaScript object
fn to_object(params: &ParamSet) -> Result<JsValue, JsValue> {
    params
        .serialize(&Serializer::json_compatible())
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize: {e}")))
}

/// `null` and `undefined` read as no params.
fn from_object(value: JsValue) -> Result<Option<ParamSet>, JsValue> {
    if value.is_null() || value.is_undefined() {
        return Ok(None);
    }
    serde_wasm_bindgen::from_value(value)
        .map(Some)
        .map_err(|e| JsValue::from_str(&format!("Invalid params: {e}")))
}

fn time_from_ms(now_ms: f64) -> Option<DateTime<Utc>> {
    if !now_ms.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(now_ms as i64)
}

fn decode(url: &str, now_ms: f64) -> Option<ParamSet> {
    let now = time_from_ms(now_ms)?;
    codec::decode_from_url(url, now, &Freshness::default())
}

/// Encode params for the `psicash` URL param.
#[wasm_bindgen(js_name = encodeParams)]
pub fn encode_params(params: JsValue) -> Result<String, JsValue> {
    let params = from_object(params)?.unwrap_or_default();
    codec::encode(&params).map_err(|e| JsValue::from_str(&format!("Failed to encode params: {e}")))
}

/// Decode fresh params from a URL's hash or query, or `null`.
///
/// `nowMs` is the current time as from `Date.now()`.
#[wasm_bindgen(js_name = decodeParamsFromUrl)]
pub fn decode_params_from_url(url: &str, now_ms: f64) -> Result<JsValue, JsValue> {
    match decode(url, now_ms) {
        Some(params) => to_object(&params),
        None => Ok(JsValue::NULL),
    }
}

/// The more recent of two params objects (either may be `null`).
#[wasm_bindgen(js_name = newestParams)]
pub fn newest_params(a: JsValue, b: JsValue) -> Result<JsValue, JsValue> {
    match newest(from_object(a)?, from_object(b)?) {
        Some(params) => to_object(&params),
        None => Ok(JsValue::NULL),
    }
}

/// Whether `distinguisher` may be claimed by the page at `referrer`.
#[wasm_bindgen(js_name = validateDistinguisher)]
pub fn validate_distinguisher(distinguisher: &str, referrer: &str) -> bool {
    match url::Url::parse(referrer) {
        Ok(referrer) => distinguisher::validate(distinguisher, &referrer),
        Err(_) => false,
    }
}

/// The namespaced local storage key for `suffix`.
#[wasm_bindgen(js_name = storageKey)]
pub fn storage_key(suffix: &str, dev: bool) -> String {
    psicash_types::storage_key(suffix, dev)
}

/// The storage key suffix holding the cooldown for a class and distinguisher.
#[wasm_bindgen(js_name = nextAllowedKey)]
pub fn next_allowed_key(class: &str, distinguisher: &str) -> String {
    psicash_types::next_allowed_key(class, distinguisher)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: f64 = 1_700_000_000_000.0;

    fn url_with(params: &ParamSet) -> String {
        format!(
            "https://example.com/#!psicash={}",
            codec::encode(params).unwrap()
        )
    }

    #[test]
    fn decodes_fresh_params_only() {
        let now = time_from_ms(NOW_MS).unwrap();
        let fresh = ParamSet::with_tokens("t").stamped(now);
        assert_eq!(decode(&url_with(&fresh), NOW_MS), Some(fresh.clone()));
        assert_eq!(decode(&url_with(&fresh), NOW_MS + 61_000.0), None);
        assert_eq!(decode(&url_with(&fresh), f64::NAN), None);
        assert_eq!(decode("https://example.com/", NOW_MS), None);
    }

    #[test]
    fn plain_helpers() {
        assert!(validate_distinguisher("example.com/a", "https://example.com/a/b"));
        assert!(!validate_distinguisher("example.com", "not a url"));
        assert_eq!(storage_key("PsiCashParams", true), "PsiCash-Dev::v2::PsiCashParams");
        assert_eq!(
            next_allowed_key("page-view", "example.com"),
            "nextAllowed::page-view::example.com"
        );
    }
}
