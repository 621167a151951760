//! Worker-side protocol for evaluating one hyperparameter sample per job.
//!
//! A job asks the scheduler (PanDA) for one event range, looks up the
//! matching sample at the coordinator (iDDS), runs the payload on the
//! sample's parameters and reports the resulting loss back, acknowledging
//! the event range only once the loss is recorded.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod execute;
mod fsutil;
pub mod packaging;
pub mod report;
pub mod resolve;
pub mod staging;
pub mod worker;

pub use client::{
    ArchiveFetcher, EventStatus, HttpTransport, IddsClient, JobScheduler, PandaClient, Sample,
    SampleCoordinator,
};
pub use config::{
    Credentials, Endpoints, InputSpec, JobIdentity, Payload, Phase, WorkerConfig,
};
pub use context::{ContextStore, RunContext};
pub use error::{RemoteError, WorkerError};
pub use event::{EventRange, EventRangeId};
pub use report::ReportOutcome;
pub use resolve::Resolution;
pub use worker::{pending_report, run_worker, Services, WorkerOutcome};
