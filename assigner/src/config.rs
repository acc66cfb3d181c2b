use crate::experiment::{Experiment, TestName, Variants};
use crate::identity::{DailySalt, SaltSource, StaticSalt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_HASH_COOKIE_NAME: &str = "_ms_h";
pub const DEFAULT_CLIENT_ID_COOKIE_NAME: &str = "_ms_cid";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Static salt cannot be empty")]
    EmptySalt,

    #[error("Cookie names cannot be empty")]
    EmptyCookieName,

    #[error("Invalid cookie domain {0:?}")]
    InvalidCookieDomain(String),

    #[error("No experiments configured")]
    NoExperiments,
}

/// Assigner service configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for assignment requests
    pub listener: Listener,
    /// Admin listener for health and readiness checks
    pub admin_listener: Listener,
    /// Cookie holding a previously issued identity hash
    #[serde(default = "default_hash_cookie_name")]
    pub hash_cookie_name: String,
    /// Cookie holding the client id, issued together with the hash cookie
    /// once consent is granted
    #[serde(default = "default_client_id_cookie_name")]
    pub client_id_cookie_name: String,
    /// `Domain` attribute of issued cookies. Host-only cookies when unset.
    #[serde(default)]
    pub cookie_domain: Option<String>,
    /// Prefer the first `X-Forwarded-For` entry over the socket peer. Only
    /// enable behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Origins allowed to read assignment responses from a browser
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Secret mixed into derived identity hashes
    pub salt: SaltConfig,
    /// Variant weights per experiment. Names and weights are validated
    /// during deserialization.
    pub experiments: BTreeMap<TestName, Variants>,
}

fn default_hash_cookie_name() -> String {
    DEFAULT_HASH_COOKIE_NAME.to_string()
}

fn default_client_id_cookie_name() -> String {
    DEFAULT_CLIENT_ID_COOKIE_NAME.to_string()
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.hash_cookie_name.is_empty() || self.client_id_cookie_name.is_empty() {
            return Err(ValidationError::EmptyCookieName);
        }

        if let Some(domain) = &self.cookie_domain {
            let valid = !domain.is_empty()
                && domain
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-'));
            if !valid {
                return Err(ValidationError::InvalidCookieDomain(domain.clone()));
            }
        }

        if let SaltConfig::Static { value } = &self.salt
            && value.is_empty()
        {
            return Err(ValidationError::EmptySalt);
        }

        if self.experiments.is_empty() {
            return Err(ValidationError::NoExperiments);
        }

        Ok(())
    }

    pub fn experiments(&self) -> BTreeMap<TestName, Experiment> {
        self.experiments
            .iter()
            .map(|(name, variants)| {
                (
                    name.clone(),
                    Experiment::new(name.clone(), variants.clone()),
                )
            })
            .collect()
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Where the identity salt comes from
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SaltConfig {
    /// Fixed value, rotated by changing configuration
    Static { value: String },
    /// Random value generated per UTC day and kept in memory
    Daily,
}

impl SaltConfig {
    pub fn build(&self) -> Arc<dyn SaltSource> {
        match self {
            SaltConfig::Static { value } => Arc::new(StaticSalt::new(value.clone())),
            SaltConfig::Daily => Arc::new(DailySalt::new()),
        }
    }
}
