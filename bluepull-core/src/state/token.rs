use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token lifecycle status.
///
/// The set is closed: serialization accepts and produces exactly these three
/// strings, and decoding anything else fails rather than inventing a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    /// Eligible for selection.
    Active,
    /// Rate-limited; restored to active by the pool-wide reset.
    Exhausted,
    /// Ejected after a 401; stays out until credentials are re-synced.
    Unauthorized,
}

/// Usage accounting for a single token, keyed by credKey in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenState {
    #[serde(default)]
    pub last_usage_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exhausted_at: Option<DateTime<Utc>>,
    pub status: TokenStatus,
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub successful_usage_count: u64,
    #[serde(default)]
    pub pre_rate_limit_success_count: u64,
}

impl Default for TokenState {
    fn default() -> Self {
        TokenState {
            last_usage_at: None,
            exhausted_at: None,
            status: TokenStatus::Active,
            status_changed_at: None,
            successful_usage_count: 0,
            pre_rate_limit_success_count: 0,
        }
    }
}

impl TokenState {
    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == TokenStatus::Exhausted
    }

    /// Unauthorized tokens are ignored by selection until re-synced.
    pub fn is_ignored(&self) -> bool {
        self.status == TokenStatus::Unauthorized
    }

    pub fn update_status(&mut self, status: TokenStatus, changed_at: DateTime<Utc>) {
        self.status = status;
        self.status_changed_at = Some(changed_at);
    }

    pub fn set_exhausted(&mut self, exhaustion_time: DateTime<Utc>) {
        self.update_status(TokenStatus::Exhausted, exhaustion_time);
        self.exhausted_at = Some(exhaustion_time);
    }

    pub fn set_unauthorized(&mut self, changed_at: DateTime<Utc>) {
        self.update_status(TokenStatus::Unauthorized, changed_at);
    }

    pub fn record_usage(&mut self, usage_time: DateTime<Utc>) {
        self.last_usage_at = Some(usage_time);
        self.successful_usage_count += 1;
    }

    /// Marks the token active again and rolls the current usage count into
    /// `pre_rate_limit_success_count`.
    pub fn reset_usage_metrics(&mut self, resume_time: DateTime<Utc>) {
        self.update_status(TokenStatus::Active, resume_time);
        self.pre_rate_limit_success_count = self.successful_usage_count;
        self.successful_usage_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn status_serializes_to_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&TokenStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(
            serde_json::to_string(&TokenStatus::Exhausted).unwrap(),
            "\"exhausted\""
        );
        assert_eq!(
            serde_json::to_string(&TokenStatus::Unauthorized).unwrap(),
            "\"unauthorized\""
        );
    }

    #[test]
    fn status_decode_is_identity_over_the_valid_set() {
        for status in [
            TokenStatus::Active,
            TokenStatus::Exhausted,
            TokenStatus::Unauthorized,
        ] {
            let encoded = serde_json::to_string(&status).unwrap();
            let decoded: TokenStatus = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, status);
        }
    }

    #[test]
    fn status_decode_fails_closed_on_unknown_strings() {
        for bad in ["\"frozen\"", "\"ACTIVE\"", "\"\"", "1"] {
            assert!(
                serde_json::from_str::<TokenStatus>(bad).is_err(),
                "expected decode failure for {bad}"
            );
        }
    }

    #[test]
    fn set_exhausted_records_timestamp_and_status() {
        let mut token = TokenState::default();
        token.set_exhausted(at(100));

        assert!(token.is_exhausted());
        assert_eq!(token.exhausted_at, Some(at(100)));
        assert_eq!(token.status_changed_at, Some(at(100)));
    }

    #[test]
    fn record_usage_increments_count() {
        let mut token = TokenState::default();
        token.record_usage(at(10));
        token.record_usage(at(20));

        assert_eq!(token.successful_usage_count, 2);
        assert_eq!(token.last_usage_at, Some(at(20)));
    }

    #[test]
    fn reset_rolls_count_into_pre_rate_limit_count() {
        let mut token = TokenState::default();
        token.record_usage(at(10));
        token.record_usage(at(20));
        token.set_exhausted(at(30));

        token.reset_usage_metrics(at(40));

        assert!(token.is_active());
        assert_eq!(token.successful_usage_count, 0);
        assert_eq!(token.pre_rate_limit_success_count, 2);
        assert_eq!(token.status_changed_at, Some(at(40)));
        // The exhaustion timestamp is history, not cleared by the reset.
        assert_eq!(token.exhausted_at, Some(at(30)));
    }

    #[test]
    fn token_state_round_trips_through_json() {
        let mut token = TokenState::default();
        token.record_usage(at(10));
        token.set_exhausted(at(30));

        let encoded = serde_json::to_string(&token).unwrap();
        let decoded: TokenState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, token);
    }
}
