//! Registration tokens gating node joins.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{Meta, impl_resource};

/// Single- or multi-use credential for node registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RegistrationTokenData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: RegistrationTokenSpec,
    #[serde(default)]
    pub status: RegistrationTokenStatus,
}

impl_resource!(RegistrationTokenData, "token");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RegistrationTokenSpec {
    /// The full token string. Returned once at create; REST reads redact it.
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// 0 = unlimited uses.
    #[serde(default)]
    pub max_uses: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RegistrationTokenStatus {
    #[serde(default)]
    pub use_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
    #[serde(default)]
    pub used_by_nodes: Vec<String>,
}

impl RegistrationTokenData {
    /// Valid iff not expired, not revoked, and uses remain.
    pub fn is_valid(&self, now: &chrono::DateTime<chrono::Utc>) -> bool {
        if self.status.revoked_at.is_some() {
            return false;
        }
        if let Some(exp) = &self.spec.expires_at {
            match chrono::DateTime::parse_from_rfc3339(exp) {
                Ok(exp) => {
                    if exp.with_timezone(&chrono::Utc) <= *now {
                        return false;
                    }
                }
                // Unparseable expiry never validates.
                Err(_) => return false,
            }
        }
        self.spec.max_uses == 0 || self.status.use_count < self.spec.max_uses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn token(max_uses: u32) -> RegistrationTokenData {
        let mut t = RegistrationTokenData::default();
        t.spec.max_uses = max_uses;
        t
    }

    #[test]
    fn test_valid_when_unused() {
        assert!(token(1).is_valid(&Utc::now()));
        assert!(token(0).is_valid(&Utc::now()));
    }

    #[test]
    fn test_invalid_when_exhausted() {
        let mut t = token(2);
        t.status.use_count = 2;
        assert!(!t.is_valid(&Utc::now()));

        // Unlimited tokens never exhaust.
        let mut t = token(0);
        t.status.use_count = 1000;
        assert!(t.is_valid(&Utc::now()));
    }

    #[test]
    fn test_invalid_when_revoked_or_expired() {
        let now = Utc::now();

        let mut t = token(0);
        t.status.revoked_at = Some(super::super::now_rfc3339());
        assert!(!t.is_valid(&now));

        let mut t = token(0);
        t.spec.expires_at = Some((now - Duration::seconds(1)).to_rfc3339());
        assert!(!t.is_valid(&now));

        let mut t = token(0);
        t.spec.expires_at = Some((now + Duration::hours(1)).to_rfc3339());
        assert!(t.is_valid(&now));

        let mut t = token(0);
        t.spec.expires_at = Some("garbage".to_string());
        assert!(!t.is_valid(&now));
    }
}
