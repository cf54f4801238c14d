use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::session::events::{Direction, EventType, SessionEvent, Stream};

/// Where a chunk passing through a filter came from.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub session_key: String,
    pub channel_id: u32,
    pub direction: Direction,
    pub stream: Stream,
}

type FilterFn = dyn Fn(&[u8], &ChannelContext) -> Vec<u8> + Send + Sync;
type CallbackFn = dyn Fn(&SessionEvent) + Send + Sync;

/// Byte transform applied to relayed channel data.
#[derive(Clone)]
pub struct ChannelFilter {
    func: Arc<FilterFn>,
}

impl ChannelFilter {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&[u8], &ChannelContext) -> Vec<u8> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }

    /// Filter replacing every occurrence of `find` with `replace`.
    pub fn replace_all(find: Vec<u8>, replace: Vec<u8>) -> Self {
        Self::new(move |data, _| replace_bytes(data, &find, &replace))
    }

    pub fn apply(&self, data: &[u8], ctx: &ChannelContext) -> Vec<u8> {
        (self.func)(data, ctx)
    }
}

impl fmt::Debug for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelFilter")
    }
}

/// Handler invoked for events of the types it subscribed to.
#[derive(Clone)]
pub struct EventCallback {
    events: HashSet<EventType>,
    handler: Arc<CallbackFn>,
}

impl EventCallback {
    pub fn new<F>(events: impl IntoIterator<Item = EventType>, handler: F) -> Self
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        Self {
            events: events.into_iter().collect(),
            handler: Arc::new(handler),
        }
    }

    pub fn wants(&self, event_type: EventType) -> bool {
        self.events.contains(&event_type)
    }

    pub fn invoke(&self, event: &SessionEvent) {
        (self.handler)(event)
    }
}

impl fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallback")
            .field("events", &self.events)
            .finish()
    }
}

/// Filters and callbacks attached to a user, each under an opaque key.
/// Order of registration is the order of application.
#[derive(Debug, Default)]
pub struct UserHooks {
    filters: RwLock<Vec<(String, ChannelFilter)>>,
    callbacks: RwLock<Vec<(String, EventCallback)>>,
}

/// Mapping of one client credential pair to an upstream target.
///
/// Identity is `username:password`; an empty password acts as a wildcard
/// for that username during authentication.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxyUser {
    #[serde(rename = "Username", alias = "username", default)]
    pub username: String,
    #[serde(rename = "Password", alias = "password", default)]
    pub password: String,
    #[serde(rename = "RemoteHost", alias = "remote_host", default)]
    pub remote_host: String,
    #[serde(rename = "RemoteUsername", alias = "remote_username", default)]
    pub remote_username: String,
    #[serde(rename = "RemotePassword", alias = "remote_password", default)]
    pub remote_password: String,
    #[serde(skip)]
    hooks: UserHooks,
}

impl ProxyUser {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        remote_host: impl Into<String>,
        remote_username: impl Into<String>,
        remote_password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            remote_host: remote_host.into(),
            remote_username: remote_username.into(),
            remote_password: remote_password.into(),
            hooks: UserHooks::default(),
        }
    }

    pub fn key(&self) -> String {
        user_key(&self.username, &self.password)
    }

    /// Copy of the credential fields, without filters or callbacks.
    pub fn clone_credentials(&self) -> Self {
        Self::new(
            self.username.clone(),
            self.password.clone(),
            self.remote_host.clone(),
            self.remote_username.clone(),
            self.remote_password.clone(),
        )
    }

    pub fn add_filter(&self, key: String, filter: ChannelFilter) {
        self.hooks.filters.write().push((key, filter));
    }

    pub fn remove_filter(&self, key: &str) -> bool {
        let mut filters = self.hooks.filters.write();
        let before = filters.len();
        filters.retain(|(k, _)| k != key);
        filters.len() != before
    }

    pub fn filter_count(&self) -> usize {
        self.hooks.filters.read().len()
    }

    /// Run `data` through every filter in registration order.
    pub fn apply_filters(&self, data: &[u8], ctx: &ChannelContext) -> Vec<u8> {
        let filters: Vec<ChannelFilter> = self
            .hooks
            .filters
            .read()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        filters
            .iter()
            .fold(data.to_vec(), |acc, filter| filter.apply(&acc, ctx))
    }

    pub fn add_callback(&self, key: String, callback: EventCallback) {
        self.hooks.callbacks.write().push((key, callback));
    }

    pub fn remove_callback(&self, key: &str) -> bool {
        let mut callbacks = self.hooks.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(k, _)| k != key);
        callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        self.hooks.callbacks.read().len()
    }

    /// Callbacks subscribed to `event_type`, in registration order.
    pub fn callbacks_for(&self, event_type: EventType) -> Vec<EventCallback> {
        self.hooks
            .callbacks
            .read()
            .iter()
            .filter(|(_, cb)| cb.wants(event_type))
            .map(|(_, cb)| cb.clone())
            .collect()
    }
}

pub fn user_key(username: &str, password: &str) -> String {
    format!("{username}:{password}")
}

/// Replace every non-overlapping occurrence of `find` in `haystack`.
pub fn replace_bytes(haystack: &[u8], find: &[u8], replace: &[u8]) -> Vec<u8> {
    if find.is_empty() || haystack.len() < find.len() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(find) {
            out.extend_from_slice(replace);
            i += find.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}
