use serde_json::Value;
use tracing::{info, warn};

use crate::client::{EventStatus, JobScheduler, SampleCoordinator};
use crate::config::JobIdentity;
use crate::context::{ContextStore, RunContext};
use crate::error::WorkerError;
use crate::event::EventRangeId;

pub const MAX_EVENT_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A pending sample was claimed and persisted.
    Resolved {
        context: RunContext,
        parameters: Value,
    },
    /// The scheduler returned no event range.
    NoWork,
    /// Every attempt ended in a transient failure or an already evaluated
    /// sample. Treated like `NoWork` by the caller, but kept distinct so the
    /// log says which one happened.
    Exhausted { attempts: usize },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }
}

/// Claims one pending sample for this job.
///
/// Each attempt fetches one event range. An already evaluated sample is
/// acknowledged as finished and a fresh event range is requested; transient
/// failures of either service consume an attempt. Only a malformed event
/// range id or a failure to persist the claim is fatal.
pub fn resolve_sample(
    job: JobIdentity,
    scheduler: &dyn JobScheduler,
    coordinator: &dyn SampleCoordinator,
    store: &ContextStore,
) -> Result<Resolution, WorkerError> {
    for attempt in 1..=MAX_EVENT_ATTEMPTS {
        let ranges = match scheduler.fetch_event_ranges(job, 1) {
            Ok(ranges) => ranges,
            Err(e) => {
                warn!(attempt, error = %e, "failed to get an event range");
                continue;
            }
        };
        let Some(range) = ranges.into_iter().next() else {
            info!(attempt, "no event range available");
            return Ok(Resolution::NoWork);
        };
        let event = EventRangeId::parse(&range.event_range_id)?;
        info!(attempt, event_range_id = %event, sample_id = event.sample_id(), "got event range");

        let sample = match coordinator.fetch_sample(job.task_id, event.sample_id()) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(
                    attempt,
                    sample_id = event.sample_id(),
                    error = %e,
                    "failed to get a sample"
                );
                continue;
            }
        };

        if let Some(loss) = sample.loss {
            info!(sample_id = event.sample_id(), loss, "sample already evaluated");
            if let Err(e) = scheduler.acknowledge_event(event.as_str(), EventStatus::Finished) {
                warn!(event_range_id = %event, error = %e, "failed to acknowledge event range");
            }
            continue;
        }

        info!(sample_id = event.sample_id(), "sample to evaluate");
        let context = RunContext::new(&event, job);
        store.save(&context, &sample.parameters)?;
        return Ok(Resolution::Resolved {
            context,
            parameters: sample.parameters,
        });
    }
    warn!(attempts = MAX_EVENT_ATTEMPTS, "gave up getting a sample");
    Ok(Resolution::Exhausted {
        attempts: MAX_EVENT_ATTEMPTS,
    })
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use crate::client::{EventStatus, JobScheduler, Sample, SampleCoordinator};
    use crate::config::JobIdentity;
    use crate::error::RemoteError;
    use crate::event::EventRange;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        FetchEvents,
        Acknowledge(String),
        FetchSample(String),
        ReportLoss(String, f64),
    }

    pub type Log = RefCell<Vec<Call>>;

    pub fn range(id: &str) -> EventRange {
        EventRange {
            event_range_id: id.to_string(),
            extra: Default::default(),
        }
    }

    pub struct FakeScheduler<'a> {
        pub log: &'a Log,
        pub replies: RefCell<VecDeque<Result<Vec<EventRange>, RemoteError>>>,
        pub ack_ok: bool,
    }

    impl<'a> FakeScheduler<'a> {
        pub fn new(log: &'a Log, replies: Vec<Result<Vec<EventRange>, RemoteError>>) -> Self {
            Self {
                log,
                replies: RefCell::new(replies.into()),
                ack_ok: true,
            }
        }
    }

    impl JobScheduler for FakeScheduler<'_> {
        fn fetch_event_ranges(
            &self,
            _job: JobIdentity,
            _n_ranges: u32,
        ) -> Result<Vec<EventRange>, RemoteError> {
            self.log.borrow_mut().push(Call::FetchEvents);
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(RemoteError::Malformed("script exhausted".into())))
        }

        fn acknowledge_event(
            &self,
            event_range_id: &str,
            status: EventStatus,
        ) -> Result<(), RemoteError> {
            assert_eq!(status, EventStatus::Finished);
            self.log
                .borrow_mut()
                .push(Call::Acknowledge(event_range_id.to_string()));
            if self.ack_ok {
                Ok(())
            } else {
                Err(RemoteError::Rejected {
                    code: 1,
                    message: "ack refused".into(),
                })
            }
        }
    }

    pub struct FakeCoordinator<'a> {
        pub log: &'a Log,
        pub samples: RefCell<VecDeque<Result<Sample, RemoteError>>>,
        pub report_ok: bool,
    }

    impl<'a> FakeCoordinator<'a> {
        pub fn new(log: &'a Log, samples: Vec<Result<Sample, RemoteError>>) -> Self {
            Self {
                log,
                samples: RefCell::new(samples.into()),
                report_ok: true,
            }
        }
    }

    impl SampleCoordinator for FakeCoordinator<'_> {
        fn fetch_sample(&self, _task_id: i64, sample_id: &str) -> Result<Sample, RemoteError> {
            self.log
                .borrow_mut()
                .push(Call::FetchSample(sample_id.to_string()));
            self.samples
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(RemoteError::NotFound(sample_id.to_string())))
        }

        fn report_loss(&self, _task_id: i64, sample_id: &str, loss: f64) -> Result<(), RemoteError> {
            self.log
                .borrow_mut()
                .push(Call::ReportLoss(sample_id.to_string(), loss));
            if self.report_ok {
                Ok(())
            } else {
                Err(RemoteError::Status {
                    status: 500,
                    body: "db down".into(),
                })
            }
        }
    }
}
