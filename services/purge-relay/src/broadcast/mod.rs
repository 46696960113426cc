//! Broadcast Pipeline
//!
//! Validated purge in, one aggregate judgment out:
//!
//! ```text
//! BroadcastRequest ─► RequestCloner × N ─► Dispatcher ─► aggregate()
//! ```

use std::time::Duration;
use tracing::{debug, warn};

pub mod aggregator;
pub mod cloner;
pub mod dispatcher;
pub mod validator;

pub use aggregator::{aggregate, counts_as_failure, status_code};
pub use cloner::{BroadcastRequest, ClonedRequest, RequestCloner};
pub use dispatcher::Dispatcher;
pub use validator::RequestValidator;

use crate::types::{AggregateResult, BackendSet, DeliveryOutcome};

pub struct Broadcaster {
    cloner: RequestCloner,
    dispatcher: Dispatcher,
    budget: Duration,
}

impl Broadcaster {
    pub fn new(cloner: RequestCloner, dispatcher: Dispatcher, budget: Duration) -> Self {
        Self {
            cloner,
            dispatcher,
            budget,
        }
    }

    /// Replay the template against every backend and judge the result.
    pub async fn broadcast(&self, template: &BroadcastRequest, backends: &BackendSet) -> AggregateResult {
        debug!(backends = %backends, "Sending {} to", template.method);

        let mut outcomes: Vec<DeliveryOutcome> = Vec::new();
        let mut clones = Vec::with_capacity(backends.len());
        for address in backends.iter() {
            match self.cloner.clone_for(template, address) {
                Ok(clone) => clones.push(clone),
                Err(e) => {
                    warn!(backend = %address, error = %e, "Cannot build request for backend");
                    outcomes.push(DeliveryOutcome::failed(address.clone(), e.to_string()));
                }
            }
        }

        let clone_failed = !outcomes.is_empty();
        outcomes.extend(
            self.dispatcher
                .dispatch_with(clones, self.budget, clone_failed)
                .await,
        );
        let result = aggregate(&outcomes, backends.len());

        if !result.is_ok() {
            for outcome in outcomes.iter().filter(|o| counts_as_failure(&o.status)) {
                warn!(backend = %outcome.address, status = %outcome.status, "Backend did not confirm purge");
            }
            warn!(
                received = result.received,
                expected = result.expected,
                "Broadcast degraded"
            );
        }

        result
    }
}
