//! Scheduler configuration parsing.

use kdl::KdlNode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::kdl_util::*;
use crate::{ConfigError, ConfigResult};

/// Which timer policy a scheduler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// One tree-stable timer for the whole scheduler.
    SingleBranch,
    /// One tree-stable timer per (codebase, project, repository, branch).
    AnyBranch,
}

/// Matches one string attribute of a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringMatcher {
    #[default]
    Any,
    OneOf(Vec<String>),
    /// A regular expression, validated when the configuration is loaded.
    Pattern(String),
}

impl StringMatcher {
    fn validate(&self, field: &str) -> ConfigResult<()> {
        if let StringMatcher::Pattern(pattern) = self {
            Regex::new(pattern).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
        }
        Ok(())
    }
}

/// Which changes a scheduler listens to. Every configured matcher must pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilterConfig {
    pub branch: StringMatcher,
    pub category: StringMatcher,
    pub project: StringMatcher,
    pub repository: StringMatcher,
    pub codebase: StringMatcher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,
    pub kind: SchedulerKind,
    pub builders: Vec<String>,
    /// Debounce interval; `None` builds every important change immediately.
    pub tree_stable_timer: Option<Duration>,
    pub filter: ChangeFilterConfig,
    /// A change is important if any of its files matches one of these
    /// patterns. Empty means every change is important.
    pub file_is_important: Vec<String>,
    /// Drop unimportant changes instead of classifying them.
    pub only_important: bool,
    pub reason: String,
}

impl SchedulerConfig {
    pub fn new(name: impl Into<String>, kind: SchedulerKind) -> Self {
        let name = name.into();
        Self {
            reason: format!("The {} scheduler was triggered by a change", name),
            name,
            kind,
            builders: Vec::new(),
            tree_stable_timer: None,
            filter: ChangeFilterConfig::default(),
            file_is_important: Vec::new(),
            only_important: false,
        }
    }

    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if self.builders.is_empty() {
            return Err(ConfigError::MissingField(format!(
                "builders for scheduler '{}'",
                self.name
            )));
        }
        self.filter.branch.validate("branch-regex")?;
        self.filter.category.validate("category-regex")?;
        self.filter.project.validate("project-regex")?;
        self.filter.repository.validate("repository-regex")?;
        self.filter.codebase.validate("codebase-regex")?;
        for pattern in &self.file_is_important {
            Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("file-is-important", e.to_string()))?;
        }
        Ok(())
    }
}

pub(crate) fn parse_scheduler(node: &KdlNode) -> ConfigResult<SchedulerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("scheduler name".to_string()))?;

    let kind = match get_string_prop(node, "kind").as_deref() {
        Some("single-branch") | None => SchedulerKind::SingleBranch,
        Some("any-branch") => SchedulerKind::AnyBranch,
        Some(other) => {
            return Err(ConfigError::invalid(
                "scheduler kind",
                format!("unknown scheduler kind: {}", other),
            ));
        }
    };

    let mut config = SchedulerConfig::new(name, kind);
    config.tree_stable_timer = get_secs_prop(node, "tree-stable-timer")?;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let args = get_all_string_args(child);
            match child.name().value() {
                "builders" => config.builders.extend(args),
                "branch" => config.filter.branch = StringMatcher::OneOf(args),
                "branch-regex" => config.filter.branch = pattern(child, "branch-regex")?,
                "category" => config.filter.category = StringMatcher::OneOf(args),
                "category-regex" => config.filter.category = pattern(child, "category-regex")?,
                "project" => config.filter.project = StringMatcher::OneOf(args),
                "project-regex" => config.filter.project = pattern(child, "project-regex")?,
                "repository" => config.filter.repository = StringMatcher::OneOf(args),
                "repository-regex" => {
                    config.filter.repository = pattern(child, "repository-regex")?
                }
                "codebase" => config.filter.codebase = StringMatcher::OneOf(args),
                "codebase-regex" => config.filter.codebase = pattern(child, "codebase-regex")?,
                "file-is-important" => config.file_is_important.extend(args),
                "only-important" => {
                    config.only_important = get_first_bool_arg(child).unwrap_or(true)
                }
                "reason" => {
                    if let Some(reason) = args.into_iter().next() {
                        config.reason = reason;
                    }
                }
                _ => {}
            }
        }
    }

    Ok(config)
}

fn pattern(node: &KdlNode, field: &str) -> ConfigResult<StringMatcher> {
    get_first_string_arg(node)
        .map(StringMatcher::Pattern)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}
