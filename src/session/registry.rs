use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::Session;

/// A proxy's sessions, indexed globally and per user key.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    all: BTreeMap<String, Arc<Session>>,
    by_user: HashMap<String, BTreeMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Register `session` under its key. A stale session already holding the
    /// key (OS port reuse) is moved to `<key>_old` instead of being replaced.
    pub fn register(&mut self, session: Arc<Session>) {
        let key = session.key().to_string();
        if let Some(stale) = self.all.remove(&key) {
            let mut old_key = format!("{key}_old");
            while self.all.contains_key(&old_key) {
                old_key.push_str("_old");
            }
            let stale_user = stale.user().key();
            if let Some(user_map) = self.by_user.get_mut(&stale_user) {
                if let Some(s) = user_map.remove(&key) {
                    user_map.insert(old_key.clone(), s);
                }
            }
            self.all.insert(old_key, stale);
        }

        self.by_user
            .entry(session.user().key())
            .or_default()
            .insert(key.clone(), session.clone());
        self.all.insert(key, session);
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.all.get(key).cloned()
    }

    /// Every session key, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.all.keys().cloned().collect()
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.all
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn user_session(&self, user_key: &str, session_key: &str) -> Option<Arc<Session>> {
        self.by_user.get(user_key)?.get(session_key).cloned()
    }

    /// Sessions owned by `user_key`, sorted by session key.
    pub fn user_sessions(&self, user_key: &str) -> Vec<(String, Arc<Session>)> {
        self.by_user
            .get(user_key)
            .map(|m| m.iter().map(|(k, s)| (k.clone(), s.clone())).collect())
            .unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<(String, Arc<Session>)> {
        self.all.iter().map(|(k, s)| (k.clone(), s.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}
