//! Bodies exchanged with the PsiCash reward API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the bearer tokens.
pub const AUTH_HEADER: &str = "X-PsiCash-Auth";

/// Header carrying the JSON-encoded request metadata.
pub const METADATA_HEADER: &str = "X-PsiCash-Metadata";

/// Path of the reward transaction endpoint.
pub const TRANSACTION_PATH: &str = "/transaction";

/// Path of the token validation endpoint.
pub const VALIDATE_TOKENS_PATH: &str = "/validate-tokens";

/// Body of a `POST /transaction` response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionBody {
    #[serde(rename = "TransactionID", default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(rename = "TransactionResponse", default)]
    pub transaction_response: Option<TransactionResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "Values", default)]
    pub values: Option<TransactionValues>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionValues {
    /// ISO-8601 time before which the same (class, distinguisher) won't be rewarded again.
    #[serde(rename = "NextAllowed", default, skip_serializing_if = "Option::is_none")]
    pub next_allowed: Option<String>,
}

impl TransactionBody {
    /// Creates a body carrying a next-allowed hint.
    pub fn with_next_allowed(transaction_id: impl Into<String>, next_allowed: impl Into<String>) -> Self {
        Self {
            transaction_id: Some(transaction_id.into()),
            transaction_response: Some(TransactionResponse {
                kind: Some("Reward".to_string()),
                values: Some(TransactionValues {
                    next_allowed: Some(next_allowed.into()),
                }),
            }),
        }
    }

    /// Extracts `TransactionResponse.Values.NextAllowed` from a raw body, if present.
    pub fn next_allowed_from(body: &str) -> Option<String> {
        let body: TransactionBody = serde_json::from_str(body).ok()?;
        body.transaction_response?.values?.next_allowed
    }
}

/// Body of a `GET /validate-tokens` response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensValid {
    #[serde(rename = "TokensValid", default)]
    pub tokens_valid: BTreeMap<String, bool>,
}

impl TokensValid {
    /// The app only hands out the earner token, so one valid token is enough.
    pub fn any_valid(&self) -> bool {
        self.tokens_valid.values().any(|valid| *valid)
    }
}
