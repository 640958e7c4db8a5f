pub mod charge;
pub mod scheduler;
pub mod service;

pub use charge::ChargeProtocol;
pub use scheduler::{BillingScheduler, TickReport};
pub use service::{ChargeHistory, PolicyService};
