//! Per-entity stage state machine.
//!
//! Pure functions over persisted status fields. Nothing here touches storage;
//! the dispatcher and monitor use these rules to decide what to write, and
//! storage re-checks the same preconditions in its `WHERE` clauses.

use outreach_shared::{
    Entity, JobStatus, MessageStatus, ScrapingStatus, Stage, SubmissionStatus,
};

/// Stage status collapsed to what orchestration cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// NO_FORM_FOUND: terminal without ever running the stage.
    Skipped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Current phase of `stage` for `entity`.
pub fn phase(entity: &Entity, stage: Stage) -> Phase {
    match stage {
        Stage::Scrape => match entity.scraping_status {
            ScrapingStatus::Pending => Phase::Pending,
            ScrapingStatus::InProgress => Phase::InProgress,
            ScrapingStatus::Completed => Phase::Succeeded,
            ScrapingStatus::Failed => Phase::Failed,
        },
        Stage::Message => match entity.message_status {
            MessageStatus::Pending => Phase::Pending,
            MessageStatus::Generating => Phase::InProgress,
            MessageStatus::Generated => Phase::Succeeded,
            MessageStatus::Failed => Phase::Failed,
        },
        Stage::Submit => match entity.submission_status {
            SubmissionStatus::Pending => Phase::Pending,
            SubmissionStatus::Submitting => Phase::InProgress,
            SubmissionStatus::Success => Phase::Succeeded,
            SubmissionStatus::Failed => Phase::Failed,
            SubmissionStatus::NoFormFound => Phase::Skipped,
        },
    }
}

/// Why a stage may not move from PENDING to in-progress.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartRejection {
    #[error("{0} stage already left PENDING")]
    NotPending(Stage),
    #[error("scraping has not completed")]
    ScrapeNotCompleted,
    #[error("message has not been generated")]
    MessageNotGenerated,
    #[error("no contact form detected")]
    NoContactForm,
    #[error("no usable company name")]
    NoCompanyName,
}

/// Preconditions for entering `stage`'s in-progress state.
pub fn check_start(entity: &Entity, stage: Stage) -> Result<(), StartRejection> {
    if phase(entity, stage) != Phase::Pending {
        return Err(StartRejection::NotPending(stage));
    }
    match stage {
        Stage::Scrape => Ok(()),
        Stage::Message => {
            if entity.scraping_status != ScrapingStatus::Completed {
                Err(StartRejection::ScrapeNotCompleted)
            } else if entity.usable_company_name().is_none() {
                Err(StartRejection::NoCompanyName)
            } else {
                Ok(())
            }
        }
        Stage::Submit => {
            if entity.message_status != MessageStatus::Generated {
                Err(StartRejection::MessageNotGenerated)
            } else if !entity.has_contact_form {
                Err(StartRejection::NoContactForm)
            } else {
                Ok(())
            }
        }
    }
}

/// The stage that is logically next for this entity: PENDING with its
/// predecessor succeeded. Derived from status fields only.
pub fn pending_stage(entity: &Entity) -> Option<Stage> {
    match (
        entity.scraping_status,
        entity.message_status,
        entity.submission_status,
    ) {
        (ScrapingStatus::Pending, _, _) => Some(Stage::Scrape),
        (ScrapingStatus::Completed, MessageStatus::Pending, _) => Some(Stage::Message),
        (_, MessageStatus::Generated, SubmissionStatus::Pending) => Some(Stage::Submit),
        _ => None,
    }
}

/// The stage currently in its in-progress value, if any.
pub fn in_flight_stage(entity: &Entity) -> Option<Stage> {
    Stage::ALL
        .into_iter()
        .find(|s| phase(entity, *s) == Phase::InProgress)
}

/// Per-entity contribution to the job aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    InFlight,
    Processed,
    Failed,
}

pub fn outcome(entity: &Entity) -> Outcome {
    if Stage::ALL
        .into_iter()
        .any(|s| phase(entity, s) == Phase::Failed)
    {
        Outcome::Failed
    } else if phase(entity, Stage::Submit).is_terminal() {
        Outcome::Processed
    } else {
        Outcome::InFlight
    }
}

/// Whether the entity reached any stage's success terminal.
pub fn reached_success(entity: &Entity) -> bool {
    Stage::ALL
        .into_iter()
        .any(|s| phase(entity, s) == Phase::Succeeded)
}

/// Aggregates recomputed from a job's entity rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: u32,
    pub processed: u32,
    pub failed: u32,
    pub in_flight: u32,
    pub any_success: bool,
}

impl Tally {
    /// Final job status once nothing is in flight, `None` while work remains.
    pub fn verdict(&self) -> Option<JobStatus> {
        if self.in_flight > 0 {
            None
        } else if self.any_success {
            Some(JobStatus::Completed)
        } else {
            Some(JobStatus::Failed)
        }
    }
}

pub fn tally(entities: &[Entity]) -> Tally {
    let mut t = Tally::default();
    for entity in entities {
        t.total += 1;
        match outcome(entity) {
            Outcome::InFlight => t.in_flight += 1,
            Outcome::Processed => t.processed += 1,
            Outcome::Failed => t.failed += 1,
        }
        t.any_success |= reached_success(entity);
    }
    t
}
