// Shared fixtures for unit tests: an in-memory engine wired against a scripted ledger.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::amount::Stroops;
use crate::claims::ClaimService;
use crate::clock::ManualClock;
use crate::execution::mock::MockLedgerClient;
use crate::funding::{DepositConfig, DepositReconciler};
use crate::ledger::memory::MemoryStore;
use crate::ledger::models::*;
use crate::ledger::store::PolicyStore;
use crate::ledger::Stores;
use crate::policies::{BillingScheduler, ChargeProtocol, PolicyService};
use crate::settlement::SettlementReconciler;

pub const OWNER_ID: Uuid = Uuid::from_u128(7);
pub const OWNER_ADDRESS: &str = "GAAZI4TCR3TY5OJHCTJC2A4QSY6CJWJH5IAJTGKIN2ER7LBNVKOCCWN7";

/// Quarter past an hour; every fixture clock starts here.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 10, 15, 0).unwrap()
}

/// An empty in-memory store whose clock stays at `t0()`.
pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(Arc::new(ManualClock::new(t0()))))
}

pub fn new_policy(hourly_rate: Stroops, initial_funding: Stroops) -> NewPolicy {
    NewPolicy {
        owner_id: OWNER_ID,
        product_id: "INCOME_PER_DIEM".into(),
        hourly_rate,
        coverage_limit: Stroops(1000),
        initial_funding,
        start_date: None,
        end_date: None,
    }
}

/// Insert an ACTIVE policy due for billing at `t0()`.
pub async fn active_policy(store: &Arc<MemoryStore>, hourly_rate: Stroops, funding: Stroops) -> Policy {
    let policy = Policy {
        id: Uuid::new_v4(),
        owner_id: OWNER_ID,
        product_id: "INCOME_PER_DIEM".into(),
        status: PolicyStatus::Active,
        settlement_address: OWNER_ADDRESS.to_string(),
        hourly_rate,
        funding_balance: funding,
        total_premium_paid: Stroops::ZERO,
        coverage_limit: Stroops(1000),
        start_date: Some(t0()),
        end_date: None,
        last_charge_at: None,
        next_charge_at: Some(t0()),
        created_at: t0(),
        updated_at: t0(),
    };
    store.insert_policy(&policy).await.unwrap();
    policy
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MockLedgerClient>,
    pub clock: Arc<ManualClock>,
    pub stores: Stores,
    pub charges: Arc<ChargeProtocol>,
    pub policies: Arc<PolicyService>,
    pub scheduler: Arc<BillingScheduler>,
    pub claims: Arc<ClaimService>,
    pub deposits: Arc<DepositReconciler>,
    pub reconciler: Arc<SettlementReconciler>,
}

pub fn harness() -> Harness {
    let timeout = Duration::from_secs(1);
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    store.register_wallet(OWNER_ID, OWNER_ADDRESS);
    let ledger = Arc::new(MockLedgerClient::new());
    let stores = Stores::memory(store.clone());

    let charges = Arc::new(ChargeProtocol::new(stores.clone(), ledger.clone(), timeout));
    let policies = Arc::new(PolicyService::new(
        stores.clone(),
        ledger.clone(),
        charges.clone(),
        clock.clone(),
        timeout,
    ));
    let scheduler = Arc::new(BillingScheduler::new(
        stores.clone(),
        policies.clone(),
        charges.clone(),
        clock.clone(),
    ));
    let claims = Arc::new(ClaimService::new(stores.clone(), ledger.clone(), clock.clone(), timeout));
    let deposits = Arc::new(DepositReconciler::new(
        stores.clone(),
        ledger.clone(),
        clock.clone(),
        DepositConfig {
            anchor_url: "https://testanchor.stellar.org".into(),
            asset_code: "XLM".into(),
        },
        timeout,
    ));
    let reconciler = Arc::new(SettlementReconciler::new(
        stores.clone(),
        clock.clone(),
        ChronoDuration::hours(1),
    ));

    Harness {
        store,
        ledger,
        clock,
        stores,
        charges,
        policies,
        scheduler,
        claims,
        deposits,
        reconciler,
    }
}
