use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Capability an admin token must carry to manage mappings and logs.
pub const MANAGE_CAPABILITY: &str = "manage_b2b_groups";

/// Nonces stay valid for one to two ticks of this length.
const NONCE_TICK_SECS: i64 = 12 * 60 * 60;

/// Mutating admin actions, each with its own anti-forgery nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    AddMapping,
    DeleteMapping,
    ClearLogs,
    ReassignUser,
}

impl AdminAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddMapping => "add_mapping",
            Self::DeleteMapping => "delete_mapping",
            Self::ClearLogs => "clear_logs",
            Self::ReassignUser => "reassign_user",
        }
    }
}

impl TryFrom<&str> for AdminAction {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "add_mapping" => Ok(Self::AddMapping),
            "delete_mapping" => Ok(Self::DeleteMapping),
            "clear_logs" => Ok(Self::ClearLogs),
            "reassign_user" => Ok(Self::ReassignUser),
            other => Err(format!("unsupported admin action: {other}")),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AdminClaims {
    pub sub: String,
    #[serde(default)]
    pub caps: Vec<String>,
    pub exp: usize,
    #[serde(default)]
    pub nbf: Option<usize>,
}

/// Authenticated administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
    pub subject: String,
}

/// Validates admin bearer tokens and issues/verifies per-action nonces.
#[derive(Clone)]
pub struct AdminAuth {
    decoding_key: DecodingKey,
    validation: Validation,
    nonce_secret: Arc<[u8]>,
}

impl AdminAuth {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            nonce_secret: Arc::from(secret.to_vec().into_boxed_slice()),
        }
    }

    /// Decodes the bearer token and checks validity window and capability.
    pub fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<AdminSession, AuthError> {
        let claims = decode::<AdminClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| AuthError::InvalidToken(format!("{err}")))?
            .claims;

        let now_ts = now.timestamp();
        if let Some(nbf) = claims.nbf {
            if now_ts < nbf as i64 {
                return Err(AuthError::InvalidToken("token_not_yet_valid".to_string()));
            }
        }
        if now_ts >= claims.exp as i64 {
            return Err(AuthError::InvalidToken("token_expired".to_string()));
        }
        if !claims.caps.iter().any(|cap| cap == MANAGE_CAPABILITY) {
            return Err(AuthError::MissingCapability);
        }

        Ok(AdminSession { subject: claims.sub })
    }

    pub fn issue_nonce(
        &self,
        action: AdminAction,
        session: &AdminSession,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        Ok(hex::encode(self.nonce_mac(action, session, tick(now))?))
    }

    /// Accepts nonces issued in the current or the previous tick.
    pub fn verify_nonce(
        &self,
        action: AdminAction,
        session: &AdminSession,
        provided: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let provided = hex::decode(provided.trim()).map_err(|_| AuthError::InvalidNonce)?;
        let current = tick(now);
        for candidate in [current, current - 1] {
            let expected = self.nonce_mac(action, session, candidate)?;
            if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
                return Ok(());
            }
        }
        Err(AuthError::InvalidNonce)
    }

    fn nonce_mac(
        &self,
        action: AdminAction,
        session: &AdminSession,
        tick: i64,
    ) -> Result<Vec<u8>, AuthError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.nonce_secret)
            .map_err(|_| AuthError::Signer)?;
        mac.update(tick.to_string().as_bytes());
        mac.update(b"|");
        mac.update(action.as_str().as_bytes());
        mac.update(b"|");
        mac.update(session.subject.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn tick(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(NONCE_TICK_SECS)
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token lacks the manage_b2b_groups capability")]
    MissingCapability,
    #[error("invalid or expired nonce")]
    InvalidNonce,
    #[error("failed to initialize nonce signer")]
    Signer,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub const ADMIN_SECRET: &[u8] = b"admin-secret";

    pub fn admin_token(caps: &[&str], exp: DateTime<Utc>) -> String {
        let claims = AdminClaims {
            sub: "admin-1".to_string(),
            caps: caps.iter().map(|c| c.to_string()).collect(),
            exp: exp.timestamp() as usize,
            nbf: None,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(ADMIN_SECRET),
        )
        .expect("encode token")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn accepts_token_with_capability() {
        let auth = AdminAuth::new(ADMIN_SECRET);
        let token = admin_token(&[MANAGE_CAPABILITY], now() + Duration::hours(1));
        let session = auth.authenticate(&token, now()).expect("valid token");
        assert_eq!(session.subject, "admin-1");
    }

    #[test]
    fn rejects_missing_capability_and_expired_tokens() {
        let auth = AdminAuth::new(ADMIN_SECRET);
        let token = admin_token(&["read_only"], now() + Duration::hours(1));
        assert!(matches!(
            auth.authenticate(&token, now()),
            Err(AuthError::MissingCapability)
        ));

        let token = admin_token(&[MANAGE_CAPABILITY], now() - Duration::seconds(1));
        assert!(matches!(
            auth.authenticate(&token, now()),
            Err(AuthError::InvalidToken(reason)) if reason == "token_expired"
        ));

        let other = AdminAuth::new(b"other-secret");
        let token = admin_token(&[MANAGE_CAPABILITY], now() + Duration::hours(1));
        assert!(other.authenticate(&token, now()).is_err());
    }

    #[test]
    fn nonce_is_bound_to_action_and_subject() {
        let auth = AdminAuth::new(ADMIN_SECRET);
        let session = AdminSession {
            subject: "admin-1".into(),
        };
        let nonce = auth
            .issue_nonce(AdminAction::AddMapping, &session, now())
            .expect("nonce");

        assert!(auth
            .verify_nonce(AdminAction::AddMapping, &session, &nonce, now())
            .is_ok());
        assert!(auth
            .verify_nonce(AdminAction::ClearLogs, &session, &nonce, now())
            .is_err());
        let stranger = AdminSession {
            subject: "admin-2".into(),
        };
        assert!(auth
            .verify_nonce(AdminAction::AddMapping, &stranger, &nonce, now())
            .is_err());
        assert!(auth
            .verify_nonce(AdminAction::AddMapping, &session, "zz", now())
            .is_err());
    }

    #[test]
    fn nonce_expires_after_two_ticks() {
        let auth = AdminAuth::new(ADMIN_SECRET);
        let session = AdminSession {
            subject: "admin-1".into(),
        };
        let nonce = auth
            .issue_nonce(AdminAction::DeleteMapping, &session, now())
            .expect("nonce");
        let later = now() + Duration::hours(12);
        assert!(auth
            .verify_nonce(AdminAction::DeleteMapping, &session, &nonce, later)
            .is_ok());
        let much_later = now() + Duration::hours(36);
        assert!(auth
            .verify_nonce(AdminAction::DeleteMapping, &session, &nonce, much_later)
            .is_err());
    }

    #[test]
    fn parses_action_names() {
        assert_eq!(
            AdminAction::try_from("reassign_user"),
            Ok(AdminAction::ReassignUser)
        );
        assert!(AdminAction::try_from("drop_tables").is_err());
    }
}
