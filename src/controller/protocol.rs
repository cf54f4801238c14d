//! Signed command protocol: HMAC-SHA256 envelopes around JSON commands,
//! and the reply shapes sent back unsigned.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{ControlError, ControlResult};
use crate::proxy::ProxyUser;
use crate::utils::{base64_bytes, base64_opt};

type HmacSha256 = Hmac<Sha256>;

pub const CREATE_PROXY: &str = "create-proxy";
pub const DESTROY_PROXY: &str = "destroy-proxy";
pub const START_PROXY: &str = "start-proxy";
pub const STOP_PROXY: &str = "stop-proxy";
pub const ACTIVATE_PROXY: &str = "activate-proxy";
pub const DEACTIVATE_PROXY: &str = "deactivate-proxy";
pub const LIST_PROXIES: &str = "list-proxies";
pub const GET_PROXY_INFO: &str = "get-proxy-info";
pub const GET_PROXY_VIEWER: &str = "get-proxy-viewer";
pub const GET_PROXY_VIEWERS: &str = "get-proxy-viewers";
pub const CREATE_SESSION_VIEWER: &str = "create-session-viewer";
pub const CREATE_USER_VIEWER: &str = "create-user-viewer";
pub const ADD_PROXY_USER: &str = "add-proxy-user";
pub const REMOVE_PROXY_USER: &str = "remove-proxy-user";
pub const ADD_USER_FILTER: &str = "add-user-filter";
pub const REMOVE_USER_FILTER: &str = "remove-user-filter";
pub const ADD_USER_CALLBACK: &str = "add-user-callback";
pub const REMOVE_USER_CALLBACK: &str = "remove-user-callback";

/// Older spellings still accepted from existing operator tooling.
pub const NEW_PROXY_VIEWER: &str = "new-proxy-viewer";
pub const ADD_CHANNEL_FILTER: &str = "add-channel-filter";
pub const REMOVE_CHANNEL_FILTER: &str = "remove-channel-filter";

/// Reply type for lines that never reached dispatch.
pub const ERROR_REPLY: &str = "error-reply";

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// A decoded command. Every field but `MessageType` is optional on the wire.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "MessageType", default)]
    pub message_type: String,
    #[serde(rename = "ProxyData", default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub proxy_data: Option<Vec<u8>>,
    #[serde(rename = "ProxyID", default, skip_serializing_if = "is_zero")]
    pub proxy_id: u64,
    #[serde(rename = "ViewerSecret", default, skip_serializing_if = "String::is_empty")]
    pub viewer_secret: String,
    #[serde(rename = "SessionKey", default, skip_serializing_if = "String::is_empty")]
    pub session_key: String,
    #[serde(rename = "Username", default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(rename = "Password", default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(rename = "FilterKey", default, skip_serializing_if = "String::is_empty")]
    pub filter_key: String,
    #[serde(rename = "CallbackKey", default, skip_serializing_if = "String::is_empty")]
    pub callback_key: String,
    #[serde(rename = "CallbackURL", default, skip_serializing_if = "String::is_empty")]
    pub callback_url: String,
    #[serde(rename = "ProxyUser", default, skip_serializing_if = "Option::is_none")]
    pub proxy_user: Option<ProxyUser>,
    #[serde(rename = "FindString", default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub find_string: Option<Vec<u8>>,
    #[serde(rename = "ReplaceString", default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub replace_string: Option<Vec<u8>>,
}

impl ControlMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            ..Self::default()
        }
    }

    pub fn with_proxy(mut self, proxy_id: u64) -> Self {
        self.proxy_id = proxy_id;
        self
    }

    /// Serialize and wrap in a signed envelope.
    pub fn sign(&self, key: &[u8]) -> ControlResult<SignedEnvelope> {
        let message = serde_json::to_vec(self)?;
        Ok(SignedEnvelope::seal(message, key))
    }
}

/// `{"Message": <base64>, "HMAC": <base64>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    #[serde(rename = "Message", with = "base64_bytes")]
    pub message: Vec<u8>,
    #[serde(rename = "HMAC", with = "base64_bytes")]
    pub hmac: Vec<u8>,
}

impl SignedEnvelope {
    pub fn seal(message: Vec<u8>, key: &[u8]) -> Self {
        let hmac = compute_hmac(key, &message);
        Self { message, hmac }
    }

    /// Check the MAC, then decode the command. A wrong MAC is always
    /// [`ControlError::HmacMismatch`], whatever the message holds.
    pub fn verify(&self, key: &[u8]) -> ControlResult<ControlMessage> {
        let expected = compute_hmac(key, &self.message);
        if !bool::from(expected.ct_eq(&self.hmac)) {
            return Err(ControlError::HmacMismatch);
        }
        Ok(serde_json::from_slice(&self.message)?)
    }

    pub fn to_json(&self) -> ControlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(line: &[u8]) -> ControlResult<Self> {
        Ok(serde_json::from_slice(line)?)
    }
}

fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Reply to one command. Entity fields carry JSON documents as bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "ProxyID", default, skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<u64>,
    #[serde(rename = "Proxies", default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub proxies: Option<Vec<u8>>,
    #[serde(rename = "Proxy", default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Vec<u8>>,
    #[serde(rename = "Viewer", default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub viewer: Option<Vec<u8>>,
    #[serde(rename = "Viewers", default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub viewers: Option<Vec<u8>>,
    #[serde(rename = "UserKey", default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(rename = "FilterKey", default, skip_serializing_if = "Option::is_none")]
    pub filter_key: Option<String>,
    #[serde(rename = "CallbackKey", default, skip_serializing_if = "Option::is_none")]
    pub callback_key: Option<String>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    /// Empty reply to a command of `message_type`.
    pub fn to(message_type: &str) -> Self {
        Self {
            message_type: format!("{message_type}-reply"),
            ..Self::default()
        }
    }

    pub fn failed(mut self, err: &ControlError) -> Self {
        self.error = Some(err.to_string());
        self
    }

    /// Reply for a line that could not be authenticated or decoded.
    pub fn rejected(err: &ControlError) -> Self {
        Self {
            message_type: ERROR_REPLY.to_string(),
            error: Some(err.to_string()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
