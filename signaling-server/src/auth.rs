use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION_V1: &str = "v1";
const MAX_TOKEN_LEN: usize = 1024;

pub const MAX_ATTEMPTS: usize = 5;

pub fn attempt_window() -> Duration {
    Duration::minutes(15)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub session_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl SessionClaims {
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }
}

/// Mints and checks `v1.<claims>.<mac>` session tokens.
#[derive(Clone)]
pub struct SessionSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl SessionSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| AuthError::Signing(e.to_string()))
    }

    pub fn issue(&self, now: DateTime<Utc>) -> Result<(SessionClaims, String), AuthError> {
        let expires = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| AuthError::Signing("session expiry out of range".to_string()))?;
        let claims = SessionClaims {
            session_id: uuid::Uuid::new_v4().to_string(),
            issued_at: now.timestamp(),
            expires_at: expires.timestamp(),
        };
        let token = self.sign(&claims)?;
        Ok((claims, token))
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        let payload = serde_json::to_vec(claims).map_err(|e| AuthError::Signing(e.to_string()))?;
        let payload_part = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.mac()?;
        mac.update(payload_part.as_bytes());
        let sig_part = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{TOKEN_VERSION_V1}.{payload_part}.{sig_part}"))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, AuthError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(AuthError::InvalidToken);
        }
        let mut parts = token.split('.');
        let (Some(TOKEN_VERSION_V1), Some(payload_part), Some(sig_part), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidToken);
        };

        let sig = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|_| AuthError::InvalidToken)?;
        let mut mac = self.mac()?;
        mac.update(payload_part.as_bytes());
        mac.verify_slice(&sig).map_err(|_| AuthError::InvalidToken)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;

        if claims.expires_at <= now.timestamp() {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }
}

pub fn check_passcode(configured: Option<&str>, supplied: Option<&str>) -> Result<(), AuthError> {
    let supplied = supplied
        .filter(|p| !p.is_empty())
        .ok_or(AuthError::PasscodeRequired)?;
    let configured = configured.ok_or(AuthError::NotConfigured)?;
    if !bool::from(supplied.as_bytes().ct_eq(configured.as_bytes())) {
        return Err(AuthError::InvalidPasscode);
    }
    Ok(())
}

/// Pulls the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ").filter(|t| !t.is_empty())
}

/// Sliding-window limiter for passcode attempts, keyed by client address.
#[derive(Debug)]
pub struct AttemptLimiter {
    max_attempts: usize,
    window: Duration,
    attempts: HashMap<IpAddr, VecDeque<DateTime<Utc>>>,
}

impl AttemptLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: HashMap::new(),
        }
    }

    /// Records an attempt, failing once the client has used up its window.
    pub fn check(&mut self, ip: IpAddr, now: DateTime<Utc>) -> Result<(), AuthError> {
        let cutoff = now - self.window;
        self.attempts.retain(|_, seen| {
            while seen.front().is_some_and(|t| *t <= cutoff) {
                seen.pop_front();
            }
            !seen.is_empty()
        });

        let seen = self.attempts.entry(ip).or_default();
        if seen.len() >= self.max_attempts {
            return Err(AuthError::RateLimited);
        }
        seen.push_back(now);
        Ok(())
    }
}

impl Default for AttemptLimiter {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS, attempt_window())
    }
}
