pub mod service;

pub use service::{ClaimService, NewClaim};
