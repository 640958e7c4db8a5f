// Scripted ledger client for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use super::client::{ExternalPayment, LedgerClient, SettlementResult};
use crate::amount::Stroops;
use crate::error::SettlementError;

#[derive(Default)]
pub struct MockLedgerClient {
    scripted: Mutex<HashMap<&'static str, VecDeque<SettlementResult<String>>>>,
    sticky: Mutex<HashMap<&'static str, SettlementError>>,
    calls: Mutex<Vec<(&'static str, String)>>,
    payments: Mutex<HashMap<String, Vec<ExternalPayment>>>,
    delay: Mutex<Option<Duration>>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one result for the next call to `method`.
    pub fn script(&self, method: &'static str, result: SettlementResult<String>) {
        self.scripted.lock().entry(method).or_default().push_back(result);
    }

    /// Fail every call to `method`.
    pub fn fail_always(&self, method: &'static str, error: SettlementError) {
        self.sticky.lock().insert(method, error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn add_payment(&self, account: &str, payment: ExternalPayment) {
        self.payments
            .lock()
            .entry(account.to_string())
            .or_default()
            .insert(0, payment);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| *m == method).count()
    }

    async fn next(&self, method: &'static str, arg: String) -> SettlementResult<String> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let n = {
            let mut calls = self.calls.lock();
            calls.push((method, arg));
            calls.len()
        };

        if let Some(result) = self.scripted.lock().get_mut(method).and_then(|q| q.pop_front()) {
            return result;
        }
        if let Some(error) = self.sticky.lock().get(method) {
            return Err(error.clone());
        }
        Ok(format!("tx-{}-{}", method, n))
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn collect_premium(&self, account: &str, amount: Stroops) -> SettlementResult<String> {
        self.next("collect_premium", format!("{}:{}", account, amount)).await
    }

    async fn collect_premium_with_ref(
        &self,
        _account: &str,
        _amount: Stroops,
        reference: &str,
    ) -> SettlementResult<String> {
        self.next("collect_premium_with_ref", reference.to_string()).await
    }

    async fn activate_policy(
        &self,
        _account: &str,
        _product_id: &str,
        _amount: Stroops,
        reference: &str,
    ) -> SettlementResult<String> {
        self.next("activate_policy", reference.to_string()).await
    }

    async fn payout(&self, account: &str, amount: Stroops) -> SettlementResult<String> {
        self.next("payout", format!("{}:{}", account, amount)).await
    }

    async fn pause_policy(&self, _account: &str, policy_id: Uuid) -> SettlementResult<()> {
        self.next("pause_policy", policy_id.to_string()).await.map(|_| ())
    }

    async fn get_balance(&self, account: &str) -> SettlementResult<Stroops> {
        if let Some(error) = self.sticky.lock().get("get_balance") {
            return Err(error.clone());
        }
        Ok(self
            .payments
            .lock()
            .get(account)
            .and_then(|p| Stroops::checked_sum(p.iter().map(|p| p.amount)).ok())
            .unwrap_or(Stroops::ZERO))
    }

    async fn get_policy(&self, policy_id: Uuid) -> SettlementResult<serde_json::Value> {
        self.next("get_policy", policy_id.to_string())
            .await
            .map(|_| serde_json::json!({ "policy": policy_id.to_string(), "active": true }))
    }

    async fn payment_history(&self, account: &str) -> SettlementResult<Vec<ExternalPayment>> {
        self.next("payment_history", account.to_string()).await?;
        Ok(self.payments.lock().get(account).cloned().unwrap_or_default())
    }
}
