// Incoming funding: anchor deposit intents and their reconciliation against the chain.

pub mod deposits;

pub use deposits::{AnchorWebhook, DepositConfig, DepositInitiated, DepositReconciler, SweepReport};
