use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An access token and the instant it stops being accepted.
///
/// Sessions are never mutated in place. The session manager replaces the
/// cached session wholesale whenever a new one is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    access_token: String,
    expiry_time: DateTime<Utc>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, expiry_time: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expiry_time,
        }
    }

    /// Build a session from a token response's `expires_in` (seconds from now).
    pub fn expiring_in(access_token: impl Into<String>, expires_in_secs: i64) -> Self {
        Self::new(access_token, Utc::now() + Duration::seconds(expires_in_secs))
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expiry_time(&self) -> DateTime<Utc> {
        self.expiry_time
    }

    pub fn has_expired(&self) -> bool {
        Utc::now() >= self.expiry_time
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expiry_time - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_in_the_future_has_not_expired() {
        let session = Session::new("token", Utc::now() + Duration::minutes(10));
        assert!(!session.has_expired());
        assert!(session.minutes_until_expiry() >= 9);
    }

    #[test]
    fn test_session_in_the_past_has_expired() {
        let session = Session::new("token", Utc::now() - Duration::seconds(10));
        assert!(session.has_expired());
        // Clamped for display
        assert_eq!(session.minutes_until_expiry(), 0);
    }

    #[test]
    fn test_session_expiring_now_counts_as_expired() {
        let session = Session::new("token", Utc::now());
        assert!(session.has_expired());
    }

    #[test]
    fn test_expiring_in_uses_seconds() {
        let session = Session::expiring_in("token", 3599);
        assert_eq!(session.access_token(), "token");
        assert!(!session.has_expired());
        assert!(session.time_until_expiry() <= Duration::seconds(3599));
        assert!(session.time_until_expiry() > Duration::seconds(3500));
    }
}
