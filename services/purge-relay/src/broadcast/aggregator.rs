//! Response Aggregator
//!
//! Folds per-backend outcomes into one judgment and the status code the caller sees.

use axum::http::StatusCode;

use crate::types::{AggregateResult, DeliveryOutcome, DeliveryStatus, OverallStatus};

/// Whether an outcome makes the whole broadcast degraded.
///
/// Any answered exchange below 500 counts: a 4xx means the backend refused
/// or had nothing to purge, not that it is unhealthy.
pub fn counts_as_failure(status: &DeliveryStatus) -> bool {
    match status {
        DeliveryStatus::Succeeded(code) => *code >= 500,
        DeliveryStatus::Failed(_) | DeliveryStatus::TimedOut => true,
    }
}

/// Reduce the outcomes of one broadcast. Order does not matter.
pub fn aggregate(outcomes: &[DeliveryOutcome], expected: usize) -> AggregateResult {
    let received = outcomes.iter().filter(|o| o.reported()).count();
    let any_failure = outcomes.iter().any(|o| counts_as_failure(&o.status));

    let status = if any_failure || outcomes.len() < expected {
        OverallStatus::Degraded
    } else {
        OverallStatus::Ok
    };

    AggregateResult {
        status,
        received,
        expected,
    }
}

/// Client-facing status for an aggregate result
pub fn status_code(result: &AggregateResult) -> StatusCode {
    match result.status {
        OverallStatus::Ok => StatusCode::OK,
        OverallStatus::Degraded => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn addr(n: u8) -> Address {
        Address::new(format!("10.0.0.{}", n), None)
    }

    #[test]
    fn test_all_success_is_ok() {
        let outcomes = vec![
            DeliveryOutcome::succeeded(addr(1), 200),
            DeliveryOutcome::succeeded(addr(2), 204),
            DeliveryOutcome::succeeded(addr(3), 404),
        ];
        let result = aggregate(&outcomes, 3);
        assert!(result.is_ok());
        assert_eq!(result.received, 3);
        assert_eq!(status_code(&result), StatusCode::OK);
    }

    #[test]
    fn test_empty_broadcast_is_ok() {
        let result = aggregate(&[], 0);
        assert!(result.is_ok());
        assert_eq!(result.expected, 0);
    }

    #[test]
    fn test_any_failure_degrades() {
        for bad in [
            DeliveryOutcome::failed(addr(2), "connection refused"),
            DeliveryOutcome::timed_out(addr(2)),
            DeliveryOutcome::succeeded(addr(2), 503),
        ] {
            let outcomes = vec![DeliveryOutcome::succeeded(addr(1), 200), bad];
            let result = aggregate(&outcomes, 2);
            assert_eq!(result.status, OverallStatus::Degraded);
            assert_eq!(status_code(&result), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn test_single_backend_both_ways() {
        assert!(aggregate(&[DeliveryOutcome::succeeded(addr(1), 200)], 1).is_ok());
        assert!(!aggregate(&[DeliveryOutcome::timed_out(addr(1))], 1).is_ok());
    }

    #[test]
    fn test_order_independent() {
        let mut outcomes = vec![
            DeliveryOutcome::succeeded(addr(1), 200),
            DeliveryOutcome::timed_out(addr(2)),
            DeliveryOutcome::succeeded(addr(3), 200),
        ];
        let forward = aggregate(&outcomes, 3);
        outcomes.reverse();
        let backward = aggregate(&outcomes, 3);

        assert_eq!(forward, backward);
        assert_eq!(forward.received, 2);
    }

    #[test]
    fn test_missing_outcomes_degrade() {
        let result = aggregate(&[DeliveryOutcome::succeeded(addr(1), 200)], 2);
        assert_eq!(result.status, OverallStatus::Degraded);
    }
}
