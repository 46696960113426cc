//! Fan-out Dispatcher
//!
//! One spawned task per backend. Outcomes are collected through a bounded
//! channel until every backend has reported or the broadcast budget runs
//! out. Tasks still in flight at the deadline are left to finish on their
//! own; their reports are dropped.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, Instrument, Span};

use super::aggregator::counts_as_failure;
use super::cloner::ClonedRequest;
use crate::config::FailurePolicy;
use crate::error::DeliveryError;
use crate::types::{Address, DeliveryOutcome};

const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    client: reqwest::Client,
    policy: FailurePolicy,
}

impl Dispatcher {
    pub fn new(per_backend_timeout: Duration, policy: FailurePolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(per_backend_timeout)
            .connect_timeout(per_backend_timeout.min(MAX_CONNECT_TIMEOUT))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create backend HTTP client")?;

        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: reqwest::Client, policy: FailurePolicy) -> Self {
        Self { client, policy }
    }

    /// Send every clone concurrently and return exactly one outcome per clone.
    pub async fn dispatch(&self, clones: Vec<ClonedRequest>, budget: Duration) -> Vec<DeliveryOutcome> {
        self.dispatch_with(clones, budget, false).await
    }

    /// Like [`Dispatcher::dispatch`], but `failure_seen` reports a failure
    /// recorded before dispatch (a backend that could not be addressed).
    /// Under short-circuit the clones are still sent, but nothing is
    /// awaited and every backend is recorded as timed out.
    pub async fn dispatch_with(
        &self,
        clones: Vec<ClonedRequest>,
        budget: Duration,
        failure_seen: bool,
    ) -> Vec<DeliveryOutcome> {
        let expected = clones.len();
        if expected == 0 {
            return Vec::new();
        }

        let deadline = Instant::now() + budget;
        let (tx, rx) = async_channel::bounded(expected);
        let pending: Vec<Address> = clones.iter().map(|c| c.target.clone()).collect();

        for clone in clones {
            let tx = tx.clone();
            let client = self.client.clone();

            tokio::spawn(
                async move {
                    let address = clone.target.clone();
                    let outcome = match deliver(&client, clone).await {
                        Ok(code) => DeliveryOutcome::succeeded(address.clone(), code),
                        Err(e) => DeliveryOutcome::failed(address.clone(), e.to_string()),
                    };
                    debug!(backend = %address, status = %outcome.status, "Backend answered");

                    if tx.send(outcome).await.is_err() {
                        debug!(backend = %address, "Late delivery outcome dropped");
                    }
                }
                .instrument(Span::current()),
            );
        }
        drop(tx);

        let short_circuit = self.policy == FailurePolicy::ShortCircuit;
        if short_circuit && failure_seen {
            debug!(pending = pending.len(), "Failure seen before dispatch, not waiting for backends");
            rx.close();
            return pending.into_iter().map(DeliveryOutcome::timed_out).collect();
        }

        collect_outcomes(rx, pending, deadline, short_circuit).await
    }
}

/// Receive reports until every pending backend answered, the deadline
/// passes, every sender is gone, or (with `short_circuit`) a failure
/// arrives. Backends left without a report are recorded as timed out.
async fn collect_outcomes(
    rx: async_channel::Receiver<DeliveryOutcome>,
    mut pending: Vec<Address>,
    deadline: Instant,
    short_circuit: bool,
) -> Vec<DeliveryOutcome> {
    let mut outcomes = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let outcome = match timeout_at(deadline, rx.recv()).await {
            Ok(Ok(outcome)) => outcome,
            // Every sender is gone: remaining tasks died without reporting
            Ok(Err(_)) => {
                debug!(pending = pending.len(), "Delivery tasks ended without reporting");
                break;
            }
            Err(_) => {
                debug!(pending = pending.len(), "Broadcast budget elapsed");
                break;
            }
        };

        if let Some(pos) = pending.iter().position(|a| *a == outcome.address) {
            pending.swap_remove(pos);
        }
        let stop = short_circuit && counts_as_failure(&outcome.status);
        outcomes.push(outcome);

        if stop {
            debug!(pending = pending.len(), "Failure seen, not waiting for remaining backends");
            break;
        }
    }
    rx.close();

    outcomes.extend(pending.into_iter().map(DeliveryOutcome::timed_out));
    outcomes
}

async fn deliver(client: &reqwest::Client, clone: ClonedRequest) -> Result<u16, DeliveryError> {
    let response = client
        .request(clone.method, clone.url)
        .headers(clone.headers)
        .body(clone.body)
        .send()
        .await?;

    Ok(response.status().as_u16())
}
