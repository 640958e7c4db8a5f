pub mod client;
#[cfg(test)]
pub mod mock;
pub mod soroban;

pub use client::{with_timeout, ExternalPayment, LedgerClient, SettlementResult};
pub use soroban::{SorobanConfig, SorobanLedgerClient};
