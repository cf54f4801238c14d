//! Session viewers: unguessable capabilities granting read access to the
//! sessions of one user, or to a single session.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

use crate::proxy::user::ProxyUser;
use crate::session::registry::SessionRegistry;
use crate::session::Session;
use crate::utils::generate_secret;

pub const VIEWER_SECRET_LEN: usize = 64;

/// Default expiration. Expiration is stored and exported but not enforced.
pub const VIEWER_NO_EXPIRATION: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerType {
    /// One session of the owning user.
    Single,
    /// Every session of the owning user.
    List,
}

impl ViewerType {
    pub fn code(self) -> u8 {
        match self {
            ViewerType::Single => 0,
            ViewerType::List => 1,
        }
    }
}

impl Serialize for ViewerType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ViewerType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(ViewerType::Single),
            1 => Ok(ViewerType::List),
            other => Err(serde::de::Error::custom(format!(
                "unknown viewer type {other}"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionViewer {
    #[serde(rename = "ViewerType")]
    pub viewer_type: ViewerType,
    #[serde(rename = "Secret")]
    pub secret: String,
    #[serde(rename = "User")]
    pub user: Arc<ProxyUser>,
    #[serde(rename = "SessionKey", default)]
    pub session_key: String,
    #[serde(rename = "Expiration", default = "default_expiration")]
    pub expiration: i64,
}

fn default_expiration() -> i64 {
    VIEWER_NO_EXPIRATION
}

impl SessionViewer {
    /// Viewer over every session of `user`.
    pub fn for_user(user: Arc<ProxyUser>) -> Self {
        Self {
            viewer_type: ViewerType::List,
            secret: generate_secret(VIEWER_SECRET_LEN),
            user,
            session_key: String::new(),
            expiration: VIEWER_NO_EXPIRATION,
        }
    }

    /// Viewer over the single session `session_key` of `user`.
    pub fn for_session(user: Arc<ProxyUser>, session_key: impl Into<String>) -> Self {
        Self {
            viewer_type: ViewerType::Single,
            session_key: session_key.into(),
            ..Self::for_user(user)
        }
    }

    /// Always false: expiration is recorded but not enforced.
    pub fn is_expired(&self) -> bool {
        false
    }

    /// Sessions visible through this viewer, sorted by session key.
    pub fn sessions(&self, registry: &SessionRegistry) -> Vec<(String, Arc<Session>)> {
        let user_key = self.user.key();
        match self.viewer_type {
            ViewerType::Single => registry
                .user_session(&user_key, &self.session_key)
                .map(|s| vec![(self.session_key.clone(), s)])
                .unwrap_or_default(),
            ViewerType::List => registry.user_sessions(&user_key),
        }
    }

    /// Link for the web player: `{base_uri}/?id={proxy_id}#signed-viewer&{secret}`.
    pub fn signed_url(&self, base_uri: &str, proxy_id: u64) -> String {
        format!("{base_uri}/?id={proxy_id}#signed-viewer&{}", self.secret)
    }
}
