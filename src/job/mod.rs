//! Job domain model
//!
//! - Transaction requests and their content hash
//! - Schedules owning an ordered list of jobs
//! - The job status state machine

pub mod model;
pub mod status;

pub use model::{
    EthTransaction, GasPriority, InternalData, Job, JobType, PrivateProtocol, Schedule, TxParams,
    TxRequest, TxType,
};
pub use status::{JobStatus, StatusLog};
