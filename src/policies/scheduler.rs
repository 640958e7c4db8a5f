// Billing Scheduler - hourly premium collection
//
// Each tick:
// - persists EXPIRED for lapsed policies
// - charges every ACTIVE policy whose cursor is due, one billing period per policy
// - pauses policies that can no longer cover an hour
//
// The period reference comes from the policy's cursor, not from "now", so overlapping
// ticks and restarts collapse onto the same reference. A policy that fell several
// hours behind catches up one period per tick.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::charge::{ChargeOutcome, ChargeProtocol};
use super::service::PolicyService;
use crate::clock::{Clock, Ticker};
use crate::error::AppResult;
use crate::ledger::models::*;
use crate::ledger::Stores;

/// What happened to one due policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Charged,
    Skipped,
    Paused,
    /// The period was settled by an earlier attempt; only the cursor moved.
    CaughtUp,
    InFlight,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub charged: usize,
    pub skipped: usize,
    pub paused: usize,
    pub caught_up: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub expired: usize,
}

impl TickReport {
    /// Policies whose billing state advanced this tick.
    pub fn processed(&self) -> usize {
        self.charged + self.skipped + self.paused + self.caught_up
    }

    fn record(&mut self, step: Step) {
        match step {
            Step::Charged => self.charged += 1,
            Step::Skipped => self.skipped += 1,
            Step::Paused => self.paused += 1,
            Step::CaughtUp => self.caught_up += 1,
            Step::InFlight => self.in_flight += 1,
        }
    }
}

pub struct BillingScheduler {
    stores: Stores,
    policies: Arc<PolicyService>,
    charges: Arc<ChargeProtocol>,
    clock: Arc<dyn Clock>,
}

impl BillingScheduler {
    pub fn new(
        stores: Stores,
        policies: Arc<PolicyService>,
        charges: Arc<ChargeProtocol>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stores,
            policies,
            charges,
            clock,
        }
    }

    /// Run one billing pass. Per-policy failures are logged and counted, never propagated.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> AppResult<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        match self.policies.expire_lapsed(now).await {
            Ok(expired) => report.expired = expired,
            Err(e) => error!("❌ Expiry pass failed: {}", e),
        }

        let due: Vec<Policy> = self
            .stores
            .policies
            .list_policies()
            .await?
            .into_iter()
            .filter(|p| p.is_due(now))
            .collect();
        report.due = due.len();

        for policy in &due {
            match self.bill(policy, now).await {
                Ok(step) => report.record(step),
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "❌ Billing failed for policy {} (ref {}): {}",
                        policy.id,
                        period_reference(policy, now),
                        e
                    );
                }
            }
        }

        if report.processed() > 0 || report.failed > 0 {
            info!(
                "🧾 Billing tick: {} due, {} charged, {} skipped, {} paused, {} caught up, {} failed",
                report.due, report.charged, report.skipped, report.paused, report.caught_up, report.failed
            );
        } else {
            debug!("Billing tick: nothing due");
        }
        Ok(report)
    }

    async fn bill(&self, policy: &Policy, now: DateTime<Utc>) -> AppResult<Step> {
        if !policy.can_cover_hour() {
            self.policies.pause(policy, "insufficient_funding", now).await?;
            return Ok(Step::Paused);
        }

        let period_start = policy.next_charge_at.unwrap_or(now);
        let reference = period_reference(policy, now);

        let outcome = self
            .charges
            .charge(policy, RefKind::Hourly, &reference, now)
            .await?;

        let step = match &outcome {
            ChargeOutcome::Collected { .. } => Step::Charged,
            ChargeOutcome::Skipped { .. } => Step::Skipped,
            ChargeOutcome::AlreadySettled(_) => Step::CaughtUp,
            ChargeOutcome::InFlight(_) => return Ok(Step::InFlight),
        };

        self.stores
            .policies
            .update_policy_fields(
                policy.id,
                PolicyPatch {
                    status: None,
                    next_charge_at: Some(Some(period_start + ChronoDuration::hours(1))),
                    last_charge_at: outcome.is_collected().then_some(now),
                },
            )
            .await?;

        Ok(step)
    }

    /// Drive `tick` from `ticker` until it stops.
    pub fn start<T: Ticker + 'static>(self: Arc<Self>, mut ticker: T) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("⏰ Billing scheduler started");
            while ticker.tick().await {
                if let Err(e) = self.tick().await {
                    error!("❌ Billing tick aborted: {}", e);
                }
            }
            info!("Billing scheduler stopped");
        })
    }
}

fn period_reference(policy: &Policy, now: DateTime<Utc>) -> String {
    refs::hourly(policy.id, policy.next_charge_at.unwrap_or(now))
}
