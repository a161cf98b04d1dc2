//! Mini-app auth hook — `X-Telegram-Init-Data` signature validation.
//!
//! The companion mini-app authenticates by forwarding the raw init-data
//! string Telegram hands to the web view. The signature scheme: drop the
//! `hash` field, sort the remaining `key=value` pairs, join with `\n`,
//! then HMAC-SHA256 with a secret derived from the bot token
//! (`HMAC("WebAppData", bot_token)`). The mini-app façade itself lives
//! outside this service; only the validation hook is exposed here.

use anyhow::{bail, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Fields of a validated init-data payload.
#[derive(Debug)]
pub struct InitData {
    fields: BTreeMap<String, String>,
}

impl InitData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// The authenticated user's chat id, from the `user` JSON field.
    pub fn user_id(&self) -> Option<i64> {
        let user = self.fields.get("user")?;
        let value: serde_json::Value = serde_json::from_str(user).ok()?;
        value["id"].as_i64()
    }
}

/// Validate a raw init-data string against the bot token. Returns the
/// decoded fields on success; any malformed input or signature mismatch is
/// an error.
pub fn validate_init_data(bot_token: &str, raw: &str) -> Result<InitData> {
    let mut fields = BTreeMap::new();
    let mut provided_hash = None;
    for pair in raw.split('&') {
        let (key, value) = match pair.split_once('=') {
            Some(kv) => kv,
            None => bail!("malformed init data pair"),
        };
        let key = urlencoding::decode(key)?.into_owned();
        let value = urlencoding::decode(value)?.into_owned();
        if key == "hash" {
            provided_hash = Some(value);
        } else {
            fields.insert(key, value);
        }
    }
    let provided_hash = match provided_hash {
        Some(h) => h,
        None => bail!("init data carries no hash"),
    };
    let provided = hex::decode(&provided_hash).map_err(|_| anyhow::anyhow!("hash is not hex"))?;

    let check_string = fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    let mut secret = HmacSha256::new_from_slice(b"WebAppData").expect("hmac accepts any key size");
    secret.update(bot_token.as_bytes());
    let secret_key = secret.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&secret_key).expect("hmac accepts any key size");
    mac.update(check_string.as_bytes());
    // verify_slice is constant-time.
    if mac.verify_slice(&provided).is_err() {
        bail!("init data signature mismatch");
    }
    Ok(InitData { fields })
}
