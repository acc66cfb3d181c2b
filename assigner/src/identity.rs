//! Visitor identity hashes.
//!
//! An identity hash is `hex(sha256(client_ip ++ user_agent ++ salt))`. The
//! salt rotates, so a hash is only stable for as long as its salt lives and
//! cannot be recomputed afterwards.

use crate::ip::{anonymize_ip, client_ip};
use crate::metrics_defs::SALT_ROTATIONS;
use chrono::{NaiveDate, Utc};
use http::HeaderMap;
use http::header::{COOKIE, USER_AGENT};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use shared::counter;
use std::net::SocketAddr;
use std::sync::Arc;

/// Source of the secret mixed into every identity hash.
pub trait SaltSource: Send + Sync {
    fn current_salt(&self) -> String;
}

/// A fixed salt, rotated by redeploying configuration.
pub struct StaticSalt {
    salt: String,
}

impl StaticSalt {
    pub fn new(salt: impl Into<String>) -> Self {
        StaticSalt { salt: salt.into() }
    }
}

impl SaltSource for StaticSalt {
    fn current_salt(&self) -> String {
        self.salt.clone()
    }
}

/// A random salt per UTC day, kept in memory only.
///
/// Only the current day's salt is retained; it is replaced the first time a
/// salt is requested for a different day.
#[derive(Default)]
pub struct DailySalt {
    current: RwLock<Option<(NaiveDate, String)>>,
}

impl DailySalt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn salt_for(&self, date: NaiveDate) -> String {
        if let Some((day, salt)) = self.current.read().as_ref()
            && *day == date
        {
            return salt.clone();
        }

        let mut current = self.current.write();
        // Another caller may have rotated while we waited for the lock
        if let Some((day, salt)) = current.as_ref()
            && *day == date
        {
            return salt.clone();
        }

        let salt = uuid::Uuid::new_v4().to_string();
        *current = Some((date, salt.clone()));
        counter!(SALT_ROTATIONS).increment(1);
        tracing::info!(%date, "Rotated identity salt");
        salt
    }
}

impl SaltSource for DailySalt {
    fn current_salt(&self) -> String {
        self.salt_for(Utc::now().date_naive())
    }
}

/// `hex(sha256(client_ip ++ user_agent ++ salt))`; a missing user agent
/// contributes nothing.
pub fn identity_hash(client_ip: &str, user_agent: Option<&str>, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_ip.as_bytes());
    hasher.update(user_agent.unwrap_or_default().as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Picks the identity hash for a request: the hash cookie when the client
/// sent one, otherwise a hash derived from client address and user agent.
#[derive(Clone)]
pub struct IdentityResolver {
    cookie_name: String,
    salt: Arc<dyn SaltSource>,
    trust_forwarded_for: bool,
}

impl IdentityResolver {
    pub fn new(
        cookie_name: impl Into<String>,
        salt: Arc<dyn SaltSource>,
        trust_forwarded_for: bool,
    ) -> Self {
        IdentityResolver {
            cookie_name: cookie_name.into(),
            salt,
            trust_forwarded_for,
        }
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
        match cookie_value(headers, &self.cookie_name) {
            Some(hash) => Some(hash.to_string()),
            None => self.derive(headers, peer),
        }
    }

    /// Hash of client address, user agent and the current salt, ignoring
    /// any hash cookie.
    pub fn derive(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
        let ip = client_ip(headers, peer, self.trust_forwarded_for)?;
        let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());
        tracing::debug!(client = %anonymize_ip(&ip), "Derived identity hash");

        Some(identity_hash(&ip, user_agent, &self.salt.current_salt()))
    }
}

/// Value of cookie `name`, if present and non-empty.
pub(crate) fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}
