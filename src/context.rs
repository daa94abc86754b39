use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one pipeline invocation. Issued once, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunIdentity(String);

impl RunIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunIdentity {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for RunIdentity {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a run needs to know about itself, built once at invocation start
/// and passed explicitly to every component that tags output with it.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: RunIdentity,
    pub flow: String,
    pub run_name: String,
    pub started_at: DateTime<Utc>,
    pub commit_id: Option<String>,
}

impl RunContext {
    pub fn start(flow: impl Into<String>, commit_id: Option<String>) -> Self {
        Self::with_identity(RunIdentity::generate(), flow, commit_id, Utc::now())
    }

    pub fn with_identity(
        run_id: RunIdentity,
        flow: impl Into<String>,
        commit_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let flow = flow.into();
        let run_name = format!("{flow} at {}", started_at.format("%Y%m%d-%H%M"));
        Self {
            run_id,
            flow,
            run_name,
            started_at,
            commit_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_name_is_derived_from_start_time() {
        let started = Utc.with_ymd_and_hms(2024, 5, 17, 9, 4, 0).unwrap();
        let ctx = RunContext::with_identity("run-1".into(), "training flow", None, started);
        assert_eq!(ctx.run_name, "training flow at 20240517-0904");
        assert_eq!(ctx.run_id.as_str(), "run-1");
    }

    #[test]
    fn generated_identities_are_unique() {
        assert_ne!(RunIdentity::generate(), RunIdentity::generate());
    }
}
