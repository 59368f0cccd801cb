//! Advisory expiry classification.
//!
//! Used for reporting and UI highlighting only. The ledger deliberately does
//! not block allocation from an expired batch; stricter FEFO enforcement is an
//! operator policy decision, not a ledger rule.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryStatus {
    Expired,
    ExpiringSoon,
    Ok,
}

/// Classify an expiry date relative to `today`.
///
/// `window_days` is the "expiring soon" horizon (default 30 in the engine
/// configuration).
pub fn classify_expiry(expiry: NaiveDate, today: NaiveDate, window_days: u32) -> ExpiryStatus {
    if expiry < today {
        return ExpiryStatus::Expired;
    }
    let horizon = today + chrono::Days::new(u64::from(window_days));
    if expiry <= horizon {
        ExpiryStatus::ExpiringSoon
    } else {
        ExpiryStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn classification_boundaries() {
        let today = d("2025-06-15");
        assert_eq!(classify_expiry(d("2025-06-14"), today, 30), ExpiryStatus::Expired);
        // Expiring today is not yet expired.
        assert_eq!(
            classify_expiry(d("2025-06-15"), today, 30),
            ExpiryStatus::ExpiringSoon
        );
        assert_eq!(
            classify_expiry(d("2025-07-15"), today, 30),
            ExpiryStatus::ExpiringSoon
        );
        assert_eq!(classify_expiry(d("2025-07-16"), today, 30), ExpiryStatus::Ok);
    }
}
