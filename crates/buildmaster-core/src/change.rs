//! Changes and source stamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ChangeId;

/// A change to a repository, as reported by a change source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub author: String,
    pub comments: String,
    /// Branch name; `None` is the repository's default branch.
    pub branch: Option<String>,
    pub category: Option<String>,
    pub revision: Option<String>,
    pub repository: String,
    pub project: String,
    pub codebase: String,
    pub files: Vec<String>,
    pub when: DateTime<Utc>,
}

impl Change {
    /// Create a change with the given id and empty metadata.
    pub fn new(id: impl Into<ChangeId>) -> Self {
        Self {
            id: id.into(),
            author: String::new(),
            comments: String::new(),
            branch: None,
            category: None,
            revision: None,
            repository: String::new(),
            project: String::new(),
            codebase: String::new(),
            files: Vec::new(),
            when: Utc::now(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_codebase(mut self, codebase: impl Into<String>) -> Self {
        self.codebase = codebase.into();
        self
    }

    /// The line of development this change belongs to.
    pub fn key(&self) -> ChangeKey {
        ChangeKey {
            codebase: self.codebase.clone(),
            project: self.project.clone(),
            repository: self.repository.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// Identifies a line of development: (codebase, project, repository, branch).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeKey {
    pub codebase: String,
    pub project: String,
    pub repository: String,
    pub branch: Option<String>,
}

impl ChangeKey {
    pub fn matches(&self, change: &Change) -> bool {
        self.codebase == change.codebase
            && self.project == change.project
            && self.repository == change.repository
            && self.branch == change.branch
    }
}

/// The exact source a build should check out for one codebase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub codebase: String,
    pub repository: String,
    pub project: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    /// Changes included in this stamp, ascending.
    pub changes: Vec<ChangeId>,
}

impl SourceStamp {
    /// Whether two stamps describe the same line of development, so requests
    /// carrying them may be collapsed into a single build.
    pub fn is_equivalent(&self, other: &SourceStamp) -> bool {
        self.codebase == other.codebase
            && self.repository == other.repository
            && self.project == other.project
            && self.branch == other.branch
    }

    /// Build one source stamp per codebase from a set of changes. Each stamp
    /// takes its branch and revision from the newest change in its codebase.
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Vec<SourceStamp> {
        let mut by_codebase: BTreeMap<&str, Vec<&Change>> = BTreeMap::new();
        for change in changes {
            by_codebase
                .entry(change.codebase.as_str())
                .or_default()
                .push(change);
        }

        by_codebase
            .into_values()
            .filter_map(|mut group| {
                group.sort_by_key(|c| c.id);
                let newest = *group.last()?;
                Some(SourceStamp {
                    codebase: newest.codebase.clone(),
                    repository: newest.repository.clone(),
                    project: newest.project.clone(),
                    branch: newest.branch.clone(),
                    revision: newest.revision.clone(),
                    changes: group.iter().map(|c| c.id).collect(),
                })
            })
            .collect()
    }
}

/// Whether two sets of stamps are pairwise equivalent per codebase.
pub fn stamps_equivalent(a: &[SourceStamp], b: &[SourceStamp]) -> bool {
    a.len() == b.len()
        && a.iter().all(|sa| {
            b.iter()
                .find(|sb| sb.codebase == sa.codebase)
                .is_some_and(|sb| sa.is_equivalent(sb))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_stamps_use_newest_change_per_codebase() {
        let mut a1 = Change::new(1).with_branch("main").with_codebase("app");
        a1.revision = Some("aaa".to_string());
        let mut a2 = Change::new(3).with_branch("main").with_codebase("app");
        a2.revision = Some("ccc".to_string());
        let mut lib = Change::new(2).with_branch("dev").with_codebase("lib");
        lib.revision = Some("bbb".to_string());

        let stamps = SourceStamp::from_changes([&a2, &lib, &a1]);
        assert_eq!(stamps.len(), 2);
        assert_eq!(stamps[0].codebase, "app");
        assert_eq!(stamps[0].revision.as_deref(), Some("ccc"));
        assert_eq!(stamps[0].changes, vec![ChangeId(1), ChangeId(3)]);
        assert_eq!(stamps[1].codebase, "lib");
        assert_eq!(stamps[1].branch.as_deref(), Some("dev"));
    }

    #[test]
    fn test_stamp_equivalence_ignores_revision() {
        let mut a = Change::new(1).with_branch("main");
        a.revision = Some("111".to_string());
        let mut b = Change::new(2).with_branch("main");
        b.revision = Some("222".to_string());
        let c = Change::new(3).with_branch("release");

        let sa = SourceStamp::from_changes([&a]);
        let sb = SourceStamp::from_changes([&b]);
        let sc = SourceStamp::from_changes([&c]);
        assert!(stamps_equivalent(&sa, &sb));
        assert!(!stamps_equivalent(&sa, &sc));
    }
}
