//! Message-driven job dispatch
//!
//! - The "start job" envelope and its in-process transport
//! - Retry classification and backoff budget
//! - The dispatcher worker running each message's retry loop

pub mod engine;
pub mod retry;
pub mod transport;

pub use engine::{JobDispatcher, MessageOutcome};
pub use retry::{classify, RetryDecision, RetryPolicy};
pub use transport::{ChannelTransport, Delivery, DeliveryReceiver, JobEnvelope, JobPublisher};
