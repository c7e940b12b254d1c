//! HTTP request handlers.

mod csr;
mod health;

pub use csr::{approve_csr, csr_status, deny_csr, submit_csr};
pub use health::healthz;
