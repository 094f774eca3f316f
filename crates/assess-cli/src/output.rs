use std::time::SystemTime;

use assess_core::models::{CoreError, CoreErrorKind, ProviderStatus, RunState, RunStatus};
use assess_core::registry::ProviderProfile;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
pub struct StatusView<'a> {
    pub run_id: u64,
    pub subject: &'a str,
    pub state: RunState,
    pub percent_complete: f64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub failure_reason: Option<&'a str>,
    pub providers: &'a [ProviderStatus],
}

impl<'a> StatusView<'a> {
    pub fn from_status(status: &'a RunStatus) -> Result<Self, CoreError> {
        let run = &status.run;
        Ok(Self {
            run_id: run.id.0,
            subject: run.subject.as_str(),
            state: run.state,
            percent_complete: status.percent_complete,
            created_at: rfc3339(run.created_at)?,
            started_at: run.started_at.map(rfc3339).transpose()?,
            finished_at: run.finished_at.map(rfc3339).transpose()?,
            failure_reason: run.failure_reason.as_deref(),
            providers: &status.providers,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ProviderListing<'a> {
    pub name: &'a str,
    pub queue_class: &'static str,
    pub timeout_ms: u128,
    pub max_attempts: u32,
}

impl<'a> ProviderListing<'a> {
    pub fn new(name: &'a str, profile: &ProviderProfile) -> Self {
        Self {
            name,
            queue_class: profile.queue_class.as_str(),
            timeout_ms: profile.timeout.as_millis(),
            max_attempts: profile.retry.max_attempts,
        }
    }
}

pub fn print_json(value: &impl Serialize) -> Result<(), CoreError> {
    let rendered = serde_json::to_string_pretty(value).map_err(|error| {
        CoreError::new(CoreErrorKind::Internal, format!("failed to render json: {error}"))
    })?;
    println!("{rendered}");
    Ok(())
}

fn rfc3339(value: SystemTime) -> Result<String, CoreError> {
    OffsetDateTime::from(value).format(&Rfc3339).map_err(|error| {
        CoreError::new(CoreErrorKind::Internal, format!("failed to format timestamp: {error}"))
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use assess_core::models::{
        ProviderName, ProviderTaskRecord, ProviderTaskState, QueueClass, RunId, RunRecord,
        RunState, RunStatus, SubjectRef,
    };

    use super::StatusView;

    #[test]
    fn status_view_renders_rfc3339_timestamps() {
        let created = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut run = RunRecord::created(RunId(5), SubjectRef::new("acme.example"), created);
        run.state = RunState::Completed;
        run.started_at = Some(created + Duration::from_millis(1_500));
        run.finished_at = Some(created + Duration::from_secs(4));
        let mut task = ProviderTaskRecord::pending(
            RunId(5),
            ProviderName::new("screenshot"),
            QueueClass::HighPriority,
            3,
            created,
        );
        task.state = ProviderTaskState::Succeeded;
        task.attempts = 1;

        let status = RunStatus::new(run, vec![task]);
        let view = StatusView::from_status(&status).unwrap();
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["run_id"], 5);
        assert_eq!(json["state"], "completed");
        assert_eq!(json["percent_complete"], 100.0);
        assert_eq!(json["created_at"], "2023-11-14T22:13:20Z");
        assert_eq!(json["started_at"], "2023-11-14T22:13:21.5Z");
        assert_eq!(json["providers"][0]["name"], "screenshot");
        assert!(json["failure_reason"].is_null());
    }
}
