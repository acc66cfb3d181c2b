//! Consent driven identity cookies.
//!
//! Granting consent stores the client id and the identity hash in cookies
//! for a year, so later requests keep their assignments across salt
//! rotations. Revoking consent expires both cookies.

use crate::errors::AssignerError;
use crate::identity::cookie_value;
use http::HeaderMap;
use std::fmt::Write;
use std::str::FromStr;

/// Lifetime of the identity cookies, one year.
pub const COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Revoked,
}

impl Consent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consent::Granted => "granted",
            Consent::Revoked => "revoked",
        }
    }
}

impl FromStr for Consent {
    type Err = AssignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "granted" => Ok(Consent::Granted),
            "revoked" => Ok(Consent::Revoked),
            other => Err(AssignerError::InvalidConsent(other.to_string())),
        }
    }
}

/// Names and scope of the cookies issued on consent changes.
#[derive(Clone, Debug)]
pub struct CookiePolicy {
    hash_cookie_name: String,
    client_id_cookie_name: String,
    domain: Option<String>,
}

impl CookiePolicy {
    pub fn new(
        hash_cookie_name: impl Into<String>,
        client_id_cookie_name: impl Into<String>,
        domain: Option<String>,
    ) -> Self {
        CookiePolicy {
            hash_cookie_name: hash_cookie_name.into(),
            client_id_cookie_name: client_id_cookie_name.into(),
            domain,
        }
    }

    /// `Set-Cookie` values for a consent change.
    ///
    /// On grant the client id cookie keeps its current value when the
    /// request carries one, otherwise a new random id is issued.
    pub fn set_cookies(
        &self,
        consent: Consent,
        request_headers: &HeaderMap,
        identity_hash: &str,
    ) -> Vec<String> {
        match consent {
            Consent::Granted => {
                let client_id = cookie_value(request_headers, &self.client_id_cookie_name)
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                vec![
                    self.cookie(&self.client_id_cookie_name, &client_id, COOKIE_MAX_AGE_SECS),
                    self.cookie(&self.hash_cookie_name, identity_hash, COOKIE_MAX_AGE_SECS),
                ]
            }
            Consent::Revoked => vec![
                self.cookie(&self.client_id_cookie_name, "", 0),
                self.cookie(&self.hash_cookie_name, "", 0),
            ],
        }
    }

    fn cookie(&self, name: &str, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{name}={value}; Max-Age={max_age}; Path=/");
        if let Some(domain) = &self.domain {
            let _ = write!(cookie, "; Domain={domain}");
        }
        cookie.push_str("; SameSite=None; Secure");
        cookie
    }
}
