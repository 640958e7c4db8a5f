pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

use std::sync::Arc;

use store::{ClaimStore, DepositStore, EventStore, PolicyStore, PremiumRefStore, WalletDirectory};

/// Every storage port the engine talks to, bundled for constructor injection.
#[derive(Clone)]
pub struct Stores {
    pub policies: Arc<dyn PolicyStore>,
    pub refs: Arc<dyn PremiumRefStore>,
    pub events: Arc<dyn EventStore>,
    pub deposits: Arc<dyn DepositStore>,
    pub claims: Arc<dyn ClaimStore>,
    pub wallets: Arc<dyn WalletDirectory>,
}

impl Stores {
    /// All entity ports from one backend, wallet mapping from another.
    pub fn from_backend<B>(backend: Arc<B>, wallets: Arc<dyn WalletDirectory>) -> Self
    where
        B: PolicyStore + PremiumRefStore + EventStore + DepositStore + ClaimStore + 'static,
    {
        Self {
            policies: backend.clone(),
            refs: backend.clone(),
            events: backend.clone(),
            deposits: backend.clone(),
            claims: backend,
            wallets,
        }
    }

    #[cfg(test)]
    pub fn memory(store: Arc<memory::MemoryStore>) -> Self {
        Self::from_backend(store.clone(), store)
    }
}
