//! Pipeline orchestration and domain logic for the outreach pipeline.
//!
//! This crate owns everything between the store and the stage workers:
//! the per-entity state machine, the durable work queue, the dispatcher that
//! advances entities and jobs, the stage runner, the stuck-process monitor,
//! retention cleanup, contact form classification, and the operator API.

pub mod cleanup;
pub mod dispatcher;
pub mod forms;
pub mod monitor;
pub mod operator;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod state;
pub mod workers;

#[cfg(test)]
pub(crate) mod testkit;

pub use cleanup::{CleanupReport, run_cleanup, run_cleanup_loop};
pub use dispatcher::{Advance, Dispatcher};
pub use forms::{FormRejection, SubmissionPlan, plan_submission};
pub use monitor::{Monitor, SweepReport};
pub use operator::{JobReport, Operator, StageCounts};
pub use queue::{Delivery, SqlQueue, UnitPayload, WorkQueue, WorkUnit};
pub use runner::StageRunner;
pub use workers::{FormSubmitter, MessageGenerator, Scraper, StageResult, SubmissionReceipt};
