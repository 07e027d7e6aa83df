use chrono::{DateTime, Utc};

/// The single live refresh session of a user: the fingerprint (`jti`) of the
/// outstanding refresh token and when it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn matches(&self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.is_live(now) && self.fingerprint == fingerprint
    }
}
