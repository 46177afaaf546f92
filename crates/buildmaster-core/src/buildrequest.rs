//! Build requests and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::SourceStamp;
use crate::{BuildRequestId, BuildsetId, MasterId};

/// A unit of pending work for one builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub buildset_id: BuildsetId,
    pub builder_name: String,
    /// Higher values are started first.
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub claimed_by: Option<MasterId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub complete: bool,
    pub results: Option<BuildResult>,
    pub reason: String,
    pub sourcestamps: Vec<SourceStamp>,
}

impl BuildRequest {
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    /// Sort key for the order in which a builder starts its requests:
    /// highest priority first, then oldest submission, then lowest id.
    pub fn start_order_key(&self) -> (std::cmp::Reverse<i32>, DateTime<Utc>, BuildRequestId) {
        (std::cmp::Reverse(self.priority), self.submitted_at, self.id)
    }
}

/// Outcome of a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildResult {
    Success,
    Warnings,
    Failure,
    Exception,
    Cancelled,
}

impl BuildResult {
    /// Numeric code used by the database layer.
    pub fn code(self) -> i32 {
        match self {
            BuildResult::Success => 0,
            BuildResult::Warnings => 1,
            BuildResult::Failure => 2,
            BuildResult::Exception => 4,
            BuildResult::Cancelled => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BuildResult::Success),
            1 => Some(BuildResult::Warnings),
            2 => Some(BuildResult::Failure),
            4 => Some(BuildResult::Exception),
            6 => Some(BuildResult::Cancelled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(id: i64, priority: i32, age_secs: i64) -> BuildRequest {
        BuildRequest {
            id: BuildRequestId(id),
            buildset_id: BuildsetId(1),
            builder_name: "linux".to_string(),
            priority,
            submitted_at: Utc::now() - Duration::seconds(age_secs),
            claimed_by: None,
            claimed_at: None,
            complete: false,
            results: None,
            reason: String::new(),
            sourcestamps: vec![],
        }
    }

    #[test]
    fn test_start_order_prefers_priority_then_age() {
        let mut reqs = vec![request(1, 0, 100), request(2, 5, 10), request(3, 0, 500)];
        reqs.sort_by_key(|r| r.start_order_key());
        let ids: Vec<_> = reqs.iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_result_codes() {
        for result in [
            BuildResult::Success,
            BuildResult::Warnings,
            BuildResult::Failure,
            BuildResult::Exception,
            BuildResult::Cancelled,
        ] {
            assert_eq!(BuildResult::from_code(result.code()), Some(result));
        }
        assert_eq!(BuildResult::from_code(3), None);
    }
}
