//! Schedule use cases
//!
//! - Send transaction: idempotent request to schedule materialization
//! - Start, resend and create jobs
//! - Job status updates, including the hand-off from a stored private payload
//!   to its marking job

mod create;
mod send;
mod start;
mod updater;

pub use create::{CreateJobUseCase, NewJob};
pub use send::{encode_method_call, SendOutcome, SendTxRequest, SendTxUseCase};
pub use start::{ResendJobUseCase, StartJobUseCase};
pub use updater::{JobStatusUpdater, StatusSink};
