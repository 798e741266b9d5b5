//! Job dispatch and nonce sequencing for multi-tenant blockchain transactions
//!
//! A client request becomes a schedule of jobs. Started jobs travel as "start job"
//! messages to the dispatcher, which crafts, signs and broadcasts them while
//! allocating nonces strictly in order per sending account.

pub mod api;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod metrics;
pub mod schedule;
pub mod service;
pub mod state;
pub mod tx;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{DispatchError, DispatchResult};
