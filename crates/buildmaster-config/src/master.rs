//! Master configuration parsing.

use buildmaster_core::{AccessMode, LockAccessSpec, LockKind, MasterId};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::kdl_util::*;
use crate::scheduler::{SchedulerConfig, parse_scheduler};
use crate::{ConfigError, ConfigResult};

/// Default time a substantiated latent worker stays up with no build.
pub const DEFAULT_BUILD_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Complete configuration of one master process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub name: String,
    pub master_id: MasterId,
    pub locks: Vec<LockConfig>,
    pub workers: Vec<WorkerConfig>,
    pub builders: Vec<BuilderConfig>,
    pub schedulers: Vec<SchedulerConfig>,
    pub prioritizer: PrioritizerKind,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            name: "buildmaster".to_string(),
            master_id: MasterId(1),
            locks: Vec::new(),
            workers: Vec::new(),
            builders: Vec::new(),
            schedulers: Vec::new(),
            prioritizer: PrioritizerKind::Default,
        }
    }
}

/// A lock identity declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    pub name: String,
    pub kind: LockKind,
    pub max_count: u32,
    /// Per-worker overrides of `max_count` (worker locks only).
    pub max_count_for_worker: BTreeMap<String, u32>,
}

impl LockConfig {
    pub fn master(name: impl Into<String>, max_count: u32) -> Self {
        Self {
            name: name.into(),
            kind: LockKind::Master,
            max_count,
            max_count_for_worker: BTreeMap::new(),
        }
    }

    pub fn worker(name: impl Into<String>, max_count: u32) -> Self {
        Self {
            kind: LockKind::Worker,
            ..Self::master(name, max_count)
        }
    }

    /// The largest count any single instance of this lock can hold.
    fn largest_max_count(&self) -> u32 {
        self.max_count_for_worker
            .values()
            .copied()
            .chain(std::iter::once(self.max_count))
            .max()
            .unwrap_or(self.max_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    /// Concurrent builds this worker accepts; `None` is unlimited.
    pub max_builds: Option<usize>,
    /// Latent workers are substantiated on demand.
    pub latent: bool,
    pub build_wait_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_builds: None,
            latent: false,
            build_wait_timeout: DEFAULT_BUILD_WAIT_TIMEOUT,
            keepalive_interval: None,
        }
    }

    pub fn latent(name: impl Into<String>) -> Self {
        Self {
            latent: true,
            ..Self::new(name)
        }
    }
}

/// How a builder picks a worker slot for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextWorkerKind {
    /// First available slot, concrete workers before latent ones.
    #[default]
    First,
    /// Available slot whose worker runs the fewest builds.
    LeastLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    pub workers: Vec<String>,
    /// Locks held for the whole build.
    pub locks: Vec<LockAccessSpec>,
    /// Locks the build's steps need; checked and claimed at admission too.
    pub step_locks: Vec<LockAccessSpec>,
    /// Start equivalent pending requests together as one build.
    pub collapse_requests: bool,
    pub next_worker: NextWorkerKind,
}

impl BuilderConfig {
    pub fn new<I, S>(name: impl Into<String>, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            workers: workers.into_iter().map(Into::into).collect(),
            locks: Vec::new(),
            step_locks: Vec::new(),
            collapse_requests: false,
            next_worker: NextWorkerKind::First,
        }
    }

    /// Every lock access a build on this builder needs.
    pub fn all_lock_accesses(&self) -> impl Iterator<Item = &LockAccessSpec> {
        self.locks.iter().chain(self.step_locks.iter())
    }
}

/// How the distributor orders builders within a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrioritizerKind {
    /// Highest request priority, then oldest request, then name.
    #[default]
    Default,
    /// Keep the order the builders were requested in.
    Unsorted,
}

/// Read and parse a master configuration file.
pub fn load_master_config(path: impl AsRef<Path>) -> ConfigResult<MasterConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_master_config(&text)
}

/// Parse and validate a master configuration from KDL text.
pub fn parse_master_config(kdl: &str) -> ConfigResult<MasterConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = MasterConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "master" => {
                if let Some(name) = get_first_string_arg(node) {
                    config.name = name;
                }
                if let Some(id) = get_u64_prop(node, "id")? {
                    let id = i64::try_from(id)
                        .map_err(|_| ConfigError::invalid("master id", "out of range"))?;
                    config.master_id = MasterId(id);
                }
            }
            "lock" => config.locks.push(parse_lock(node)?),
            "worker" => config.workers.push(parse_worker(node)?),
            "builder" => config.builders.push(parse_builder(node)?),
            "scheduler" => config.schedulers.push(parse_scheduler(node)?),
            "prioritizer" => {
                config.prioritizer = match get_first_string_arg(node).as_deref() {
                    Some("default") | None => PrioritizerKind::Default,
                    Some("unsorted") => PrioritizerKind::Unsorted,
                    Some(other) => {
                        return Err(ConfigError::invalid(
                            "prioritizer",
                            format!("unknown prioritizer: {}", other),
                        ));
                    }
                };
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

fn parse_lock(node: &KdlNode) -> ConfigResult<LockConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("lock name".to_string()))?;

    let kind = match get_string_prop(node, "kind").as_deref() {
        Some("master") | None => LockKind::Master,
        Some("worker") => LockKind::Worker,
        Some(other) => {
            return Err(ConfigError::invalid(
                "lock kind",
                format!("unknown lock kind: {}", other),
            ));
        }
    };
    let max_count = get_u32_prop(node, "max-count")?.unwrap_or(1);

    let mut max_count_for_worker = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "worker" {
                continue;
            }
            let worker = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField(format!("worker in lock '{}'", name)))?;
            let count = get_u32_prop(child, "max-count")?.ok_or_else(|| {
                ConfigError::MissingField(format!("max-count for worker '{}'", worker))
            })?;
            max_count_for_worker.insert(worker, count);
        }
    }

    Ok(LockConfig {
        name,
        kind,
        max_count,
        max_count_for_worker,
    })
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;

    let mut worker = WorkerConfig::new(name);
    worker.max_builds = get_u64_prop(node, "max-builds")?.map(|n| n as usize);
    worker.latent = get_bool_prop(node, "latent").unwrap_or(false);
    if let Some(timeout) = get_secs_prop(node, "build-wait-timeout")? {
        worker.build_wait_timeout = timeout;
    }
    worker.keepalive_interval = get_secs_prop(node, "keepalive-interval")?;
    Ok(worker)
}

fn parse_builder(node: &KdlNode) -> ConfigResult<BuilderConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("builder name".to_string()))?;

    let mut builder = BuilderConfig::new(name, Vec::<String>::new());
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "workers" => builder.workers.extend(get_all_string_args(child)),
                "lock" => builder.locks.push(parse_lock_access(child)?),
                "step-lock" => builder.step_locks.push(parse_lock_access(child)?),
                "collapse-requests" => {
                    builder.collapse_requests = get_first_bool_arg(child).unwrap_or(true)
                }
                "next-worker" => {
                    builder.next_worker = match get_first_string_arg(child).as_deref() {
                        Some("first") | None => NextWorkerKind::First,
                        Some("least-loaded") => NextWorkerKind::LeastLoaded,
                        Some(other) => {
                            return Err(ConfigError::invalid(
                                "next-worker",
                                format!("unknown next-worker policy: {}", other),
                            ));
                        }
                    };
                }
                _ => {}
            }
        }
    }

    if get_child_args(node, "workers").is_none() {
        return Err(ConfigError::MissingField(format!(
            "workers for builder '{}'",
            builder.name
        )));
    }
    Ok(builder)
}

fn parse_lock_access(node: &KdlNode) -> ConfigResult<LockAccessSpec> {
    let lock_name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("lock name in access".to_string()))?;
    let mode = match get_string_prop(node, "access").as_deref() {
        Some("counting") | None => AccessMode::Counting,
        Some("exclusive") => AccessMode::Exclusive,
        Some(other) => {
            return Err(ConfigError::invalid(
                "access",
                format!("unknown lock access mode: {}", other),
            ));
        }
    };
    let count = get_u32_prop(node, "count")?.unwrap_or(1);
    Ok(LockAccessSpec {
        lock_name,
        mode,
        count,
    })
}

impl MasterConfig {
    /// Check names are unique and every reference resolves.
    pub fn validate(&self) -> ConfigResult<()> {
        unique_names(self.locks.iter().map(|l| l.name.as_str()), "lock")?;
        let workers = unique_names(self.workers.iter().map(|w| w.name.as_str()), "worker")?;
        let builders = unique_names(self.builders.iter().map(|b| b.name.as_str()), "builder")?;
        unique_names(self.schedulers.iter().map(|s| s.name.as_str()), "scheduler")?;

        let lock_by_name: HashMap<&str, &LockConfig> =
            self.locks.iter().map(|l| (l.name.as_str(), l)).collect();

        for lock in &self.locks {
            if lock.max_count < 1 {
                return Err(ConfigError::invalid(
                    "max-count",
                    format!("lock '{}' must allow at least one holder", lock.name),
                ));
            }
            if lock.kind == LockKind::Master && !lock.max_count_for_worker.is_empty() {
                return Err(ConfigError::invalid(
                    "lock",
                    format!("master lock '{}' cannot have per-worker counts", lock.name),
                ));
            }
            for (worker, count) in &lock.max_count_for_worker {
                if !workers.contains(worker.as_str()) {
                    return Err(ConfigError::InvalidReference(format!(
                        "lock '{}' refers to unknown worker '{}'",
                        lock.name, worker
                    )));
                }
                if *count < 1 {
                    return Err(ConfigError::invalid(
                        "max-count",
                        format!("lock '{}' on worker '{}' must be at least 1", lock.name, worker),
                    ));
                }
            }
        }

        for builder in &self.builders {
            if builder.workers.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "workers for builder '{}'",
                    builder.name
                )));
            }
            for worker in &builder.workers {
                if !workers.contains(worker.as_str()) {
                    return Err(ConfigError::InvalidReference(format!(
                        "builder '{}' uses unknown worker '{}'",
                        builder.name, worker
                    )));
                }
            }
            for access in builder.all_lock_accesses() {
                let Some(lock) = lock_by_name.get(access.lock_name.as_str()) else {
                    return Err(ConfigError::InvalidReference(format!(
                        "builder '{}' uses unknown lock '{}'",
                        builder.name, access.lock_name
                    )));
                };
                if access.count < 1 {
                    return Err(ConfigError::invalid(
                        "count",
                        format!("access to lock '{}' must take at least 1", lock.name),
                    ));
                }
                if access.mode == AccessMode::Counting && access.count > lock.largest_max_count()
                {
                    return Err(ConfigError::invalid(
                        "count",
                        format!(
                            "builder '{}' takes {} of lock '{}' which allows {}",
                            builder.name, access.count, lock.name, lock.max_count
                        ),
                    ));
                }
            }
        }

        for scheduler in &self.schedulers {
            scheduler.validate()?;
            for builder in &scheduler.builders {
                if !builders.contains(builder.as_str()) {
                    return Err(ConfigError::InvalidReference(format!(
                        "scheduler '{}' triggers unknown builder '{}'",
                        scheduler.name, builder
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn builder(&self, name: &str) -> Option<&BuilderConfig> {
        self.builders.iter().find(|b| b.name == name)
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn lock(&self, name: &str) -> Option<&LockConfig> {
        self.locks.iter().find(|l| l.name == name)
    }
}

fn unique_names<'a>(
    names: impl Iterator<Item = &'a str>,
    what: &str,
) -> ConfigResult<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate(format!("{} '{}'", what, name)));
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{SchedulerKind, StringMatcher};

    const FULL: &str = r#"
        master "main" id=7

        lock "deploy" kind="master" max-count=1
        lock "cpu" kind="worker" max-count=2 {
            worker "big-box" max-count=8
        }

        worker "linux-1" max-builds=2
        worker "big-box"
        worker "ec2-spot" latent=#true build-wait-timeout=120 keepalive-interval=30

        builder "linux" {
            workers "linux-1" "big-box" "ec2-spot"
            lock "cpu" access="counting"
            lock "deploy" access="exclusive"
            step-lock "cpu" access="counting" count=2
            collapse-requests #true
            next-worker "least-loaded"
        }

        scheduler "main" kind="any-branch" tree-stable-timer=60 {
            builders "linux"
            branch-regex "^release/"
            file-is-important "\\.rs$"
            only-important #true
            reason "release branch changed"
        }

        prioritizer "unsorted"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_master_config(FULL).unwrap();
        assert_eq!(config.name, "main");
        assert_eq!(config.master_id, MasterId(7));
        assert_eq!(config.prioritizer, PrioritizerKind::Unsorted);

        let cpu = config.lock("cpu").unwrap();
        assert_eq!(cpu.kind, LockKind::Worker);
        assert_eq!(cpu.max_count, 2);
        assert_eq!(cpu.max_count_for_worker.get("big-box"), Some(&8));

        let spot = config.worker("ec2-spot").unwrap();
        assert!(spot.latent);
        assert_eq!(spot.build_wait_timeout, Duration::from_secs(120));
        assert_eq!(spot.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.worker("linux-1").unwrap().max_builds, Some(2));

        let linux = config.builder("linux").unwrap();
        assert_eq!(linux.workers.len(), 3);
        assert_eq!(linux.locks.len(), 2);
        assert_eq!(linux.locks[1], LockAccessSpec::exclusive("deploy"));
        assert_eq!(linux.step_locks[0], LockAccessSpec::counting("cpu").with_count(2));
        assert!(linux.collapse_requests);
        assert_eq!(linux.next_worker, NextWorkerKind::LeastLoaded);

        let main = &config.schedulers[0];
        assert_eq!(main.kind, SchedulerKind::AnyBranch);
        assert_eq!(main.tree_stable_timer, Some(Duration::from_secs(60)));
        assert_eq!(
            main.filter.branch,
            StringMatcher::Pattern("^release/".to_string())
        );
        assert!(main.only_important);
        assert_eq!(main.reason, "release branch changed");
    }

    #[test]
    fn test_unknown_access_mode_is_rejected() {
        let kdl = r#"
            lock "db"
            worker "w1"
            builder "b" {
                workers "w1"
                lock "db" access="shared"
            }
        "#;
        assert!(matches!(
            parse_master_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_unknown_lock_reference() {
        let kdl = r#"
            worker "w1"
            builder "b" {
                workers "w1"
                lock "missing"
            }
        "#;
        assert!(matches!(
            parse_master_config(kdl).unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_unknown_worker_reference() {
        let kdl = r#"
            worker "w1"
            builder "b" {
                workers "w2"
            }
        "#;
        assert!(matches!(
            parse_master_config(kdl).unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_duplicate_builder() {
        let kdl = r#"
            worker "w1"
            builder "b" {
                workers "w1"
            }
            builder "b" {
                workers "w1"
            }
        "#;
        assert!(matches!(
            parse_master_config(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_zero_max_count_is_rejected() {
        let kdl = r#"lock "db" max-count=0"#;
        assert!(parse_master_config(kdl).is_err());
    }

    #[test]
    fn test_counting_access_larger_than_lock() {
        let kdl = r#"
            lock "db" max-count=2
            worker "w1"
            builder "b" {
                workers "w1"
                lock "db" count=3
            }
        "#;
        assert!(parse_master_config(kdl).is_err());
    }

    #[test]
    fn test_scheduler_requires_known_builder() {
        let kdl = r#"
            worker "w1"
            builder "b" {
                workers "w1"
            }
            scheduler "s" {
                builders "nope"
            }
        "#;
        assert!(matches!(
            parse_master_config(kdl).unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let kdl = r#"
            worker "w1"
            builder "b" {
                workers "w1"
            }
            scheduler "s" {
                builders "b"
                file-is-important "(unclosed"
            }
        "#;
        assert!(matches!(
            parse_master_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_builder_without_workers() {
        let kdl = r#"builder "b""#;
        assert!(matches!(
            parse_master_config(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }
}
