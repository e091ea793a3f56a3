//! Host-provided `init_data`: a form-encoded bag of fields, optionally signed
//! with the bot token.

use crate::SimError;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

const SECRET_KEY_LABEL: &[u8] = b"WebAppData";

#[derive(Clone, Debug, Deserialize)]
pub struct HostUser {
    pub id: u64,
    #[serde(default)]
    pub username: Option<String>,
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(message);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Hex signature over every field except `hash`, sorted by key.
fn signature(fields: &BTreeMap<String, String>, bot_token: &str) -> Option<String> {
    let check_string = fields
        .iter()
        .filter(|(key, _)| key.as_str() != "hash")
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n");
    let secret = hmac_sha256(SECRET_KEY_LABEL, bot_token.as_bytes())?;
    hmac_sha256(&secret, check_string.as_bytes()).map(hex::encode)
}

/// Build `init_data` for a user, signed when a bot token is given.
pub fn init_data(user_id: u64, username: &str, bot_token: Option<&str>) -> String {
    let mut fields = BTreeMap::from([
        ("auth_date".to_string(), "1700000000".to_string()),
        ("query_id".to_string(), format!("sim-{user_id}")),
        (
            "user".to_string(),
            serde_json::json!({ "id": user_id, "username": username }).to_string(),
        ),
    ]);
    if let Some(hash) = bot_token.and_then(|token| signature(&fields, token)) {
        fields.insert("hash".to_string(), hash);
    }
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter())
        .finish()
}

/// Parse `init_data` and, when a bot token is configured, check its
/// signature.
pub fn verify_init_data(raw: &str, bot_token: Option<&str>) -> Result<HostUser, SimError> {
    let fields: BTreeMap<String, String> = form_urlencoded::parse(raw.trim().as_bytes())
        .into_owned()
        .collect();
    if let Some(token) = bot_token {
        let presented = fields
            .get("hash")
            .ok_or(SimError::Unauthorized("invalid_init_data"))?;
        let expected = signature(&fields, token).ok_or(SimError::Unauthorized("invalid_init_data"))?;
        if !expected.eq_ignore_ascii_case(presented) {
            return Err(SimError::Unauthorized("invalid_init_data"));
        }
    }
    let user = fields
        .get("user")
        .ok_or(SimError::Unauthorized("invalid_init_data"))?;
    serde_json::from_str(user).map_err(|_| SimError::Unauthorized("invalid_init_data"))
}
