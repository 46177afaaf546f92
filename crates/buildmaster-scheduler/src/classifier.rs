//! Change-driven scheduling with tree-stable debouncing.
//!
//! A [`ChangeClassifier`] watches incoming changes, records whether each one
//! is important, and once the tree has been quiet for the configured
//! interval turns everything accumulated into a single buildset. Important
//! changes (re)start the timer; unimportant ones only ride along.
//!
//! Classifications are persisted before a timer is armed, so a restarted
//! master re-arms timers from what is in the database and loses nothing.

use buildmaster_config::{ChangeFilterConfig, SchedulerConfig, SchedulerKind, StringMatcher};
use buildmaster_core::{Change, ChangeId, ChangeKey, SchedulerId, SourceStamp};
use buildmaster_db::{ClassificationFilter, Database, DbError, NewBuildset};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::BuildRequestEvent;
use crate::SchedulerResult;

/// Identifies one tree-stable timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// The single timer of a single-branch scheduler.
    Only,
    /// One timer per line of development.
    Branch(ChangeKey),
}

/// How changes map onto timers and their classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPolicy {
    SingleBranch,
    AnyBranch,
}

impl TimerPolicy {
    pub fn timer_key(&self, change: &Change) -> TimerKey {
        match self {
            TimerPolicy::SingleBranch => TimerKey::Only,
            TimerPolicy::AnyBranch => TimerKey::Branch(change.key()),
        }
    }

    /// Which classifications belong to the timer `key`.
    pub fn classification_filter(&self, key: &TimerKey) -> ClassificationFilter {
        match key {
            TimerKey::Only => ClassificationFilter::All,
            TimerKey::Branch(change_key) => ClassificationFilter::Matching(change_key.clone()),
        }
    }
}

impl From<SchedulerKind> for TimerPolicy {
    fn from(kind: SchedulerKind) -> Self {
        match kind {
            SchedulerKind::SingleBranch => TimerPolicy::SingleBranch,
            SchedulerKind::AnyBranch => TimerPolicy::AnyBranch,
        }
    }
}

pub type ChangePredicate = Arc<dyn Fn(&Change) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
enum Matcher {
    Any,
    OneOf(Vec<String>),
    Pattern(Regex),
}

impl Matcher {
    fn compile(config: &StringMatcher) -> SchedulerResult<Self> {
        Ok(match config {
            StringMatcher::Any => Matcher::Any,
            StringMatcher::OneOf(values) => Matcher::OneOf(values.clone()),
            StringMatcher::Pattern(pattern) => Matcher::Pattern(Regex::new(pattern)?),
        })
    }

    fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (Matcher::Any, _) => true,
            (Matcher::OneOf(values), Some(value)) => values.iter().any(|v| v == value),
            (Matcher::Pattern(regex), Some(value)) => regex.is_match(value),
            (_, None) => false,
        }
    }
}

/// Decides which changes a scheduler listens to.
#[derive(Clone)]
pub struct ChangeFilter {
    branch: Matcher,
    category: Matcher,
    project: Matcher,
    repository: Matcher,
    codebase: Matcher,
    custom: Option<ChangePredicate>,
}

impl ChangeFilter {
    pub fn from_config(config: &ChangeFilterConfig) -> SchedulerResult<Self> {
        Ok(Self {
            branch: Matcher::compile(&config.branch)?,
            category: Matcher::compile(&config.category)?,
            project: Matcher::compile(&config.project)?,
            repository: Matcher::compile(&config.repository)?,
            codebase: Matcher::compile(&config.codebase)?,
            custom: None,
        })
    }

    /// Accept every change.
    pub fn any() -> Self {
        Self {
            branch: Matcher::Any,
            category: Matcher::Any,
            project: Matcher::Any,
            repository: Matcher::Any,
            codebase: Matcher::Any,
            custom: None,
        }
    }

    /// Also require `predicate` to accept the change.
    pub fn with_predicate(mut self, predicate: ChangePredicate) -> Self {
        self.custom = Some(predicate);
        self
    }

    pub fn matches(&self, change: &Change) -> bool {
        self.branch.matches(change.branch.as_deref())
            && self.category.matches(change.category.as_deref())
            && self.project.matches(Some(&change.project))
            && self.repository.matches(Some(&change.repository))
            && self.codebase.matches(Some(&change.codebase))
            && self.custom.as_ref().is_none_or(|predicate| predicate(change))
    }
}

/// Decides whether a change restarts the tree-stable timer.
#[derive(Clone)]
pub enum Importance {
    All,
    /// Important if any touched file matches one of the patterns.
    Files(Vec<Regex>),
    Custom(ChangePredicate),
}

impl Importance {
    pub fn from_patterns(patterns: &[String]) -> SchedulerResult<Self> {
        if patterns.is_empty() {
            return Ok(Importance::All);
        }
        let regexes = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Importance::Files(regexes))
    }

    pub fn is_important(&self, change: &Change) -> bool {
        match self {
            Importance::All => true,
            Importance::Files(regexes) => change
                .files
                .iter()
                .any(|file| regexes.iter().any(|r| r.is_match(file))),
            Importance::Custom(predicate) => predicate(change),
        }
    }
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    listener: Option<JoinHandle<()>>,
    timers: HashMap<TimerKey, ArmedTimer>,
}

struct Inner {
    name: String,
    scheduler_id: SchedulerId,
    builders: Vec<String>,
    reason: String,
    policy: TimerPolicy,
    tree_stable_timer: Option<Duration>,
    filter: ChangeFilter,
    importance: Importance,
    only_important: bool,
    db: Database,
    events: mpsc::UnboundedSender<BuildRequestEvent>,
    state: Mutex<RunState>,
    /// Serializes change handling and timer firing.
    serial: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

/// Cheap to clone; clones drive the same scheduler.
#[derive(Clone)]
pub struct ChangeClassifier {
    inner: Arc<Inner>,
}

impl ChangeClassifier {
    pub fn from_config(
        config: &SchedulerConfig,
        scheduler_id: SchedulerId,
        db: Database,
        events: mpsc::UnboundedSender<BuildRequestEvent>,
    ) -> SchedulerResult<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                scheduler_id,
                builders: config.builders.clone(),
                reason: config.reason.clone(),
                policy: config.kind.into(),
                tree_stable_timer: config.tree_stable_timer,
                filter: ChangeFilter::from_config(&config.filter)?,
                importance: Importance::from_patterns(&config.file_is_important)?,
                only_important: config.only_important,
                db,
                events,
                state: Mutex::new(RunState::default()),
                serial: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Build a scheduler under the id registered for its name.
    pub async fn load(
        config: &SchedulerConfig,
        db: Database,
        events: mpsc::UnboundedSender<BuildRequestEvent>,
    ) -> SchedulerResult<Self> {
        let scheduler_id = db.schedulers.find_scheduler_id(&config.name).await?;
        Self::from_config(config, scheduler_id, db, events)
    }

    /// Replace the change filter. Only effective before [`Self::start`].
    pub fn with_filter(self, filter: ChangeFilter) -> Self {
        self.map_inner(|inner| inner.filter = filter)
    }

    /// Replace the importance rule. Only effective before [`Self::start`].
    pub fn with_importance(self, importance: Importance) -> Self {
        self.map_inner(|inner| inner.importance = importance)
    }

    fn map_inner(self, f: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!(scheduler = %inner.name, "Scheduler already shared, keeping its rules");
                Self { inner }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scheduler_id(&self) -> SchedulerId {
        self.inner.scheduler_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    /// Number of armed tree-stable timers.
    pub fn pending_timers(&self) -> usize {
        self.inner.lock_state().timers.len()
    }

    /// Re-arm timers for changes classified before a restart, then follow
    /// `changes`.
    pub async fn start(&self, mut changes: broadcast::Receiver<Change>) {
        {
            let mut state = self.inner.lock_state();
            if state.running {
                return;
            }
            state.running = true;
        }
        info!(scheduler = %self.inner.name, "Starting scheduler");

        self.inner.scan_existing_classified_changes().await;

        let inner = self.inner.clone();
        let listener = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => inner.handle_change(&change).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(scheduler = %inner.name, missed, "Scheduler fell behind on changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.lock_state().listener = Some(listener);
    }

    /// Stop listening and cancel every armed timer. Classifications stay in
    /// the database for the next start.
    pub async fn stop(&self) {
        let _serial = self.inner.serial.lock().await;
        let mut state = self.inner.lock_state();
        state.running = false;
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        for (_, timer) in state.timers.drain() {
            timer.handle.abort();
        }
        info!(scheduler = %self.inner.name, "Stopped scheduler");
    }

    /// Run a change through the filter and importance rules.
    pub async fn handle_change(&self, change: &Change) {
        self.inner.handle_change(change).await
    }

    /// Handle a change whose importance is already known.
    pub async fn got_change(&self, change: &Change, important: bool) {
        self.inner.got_change(change, important).await
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn handle_change(self: &Arc<Self>, change: &Change) {
        if !self.filter.matches(change) {
            debug!(scheduler = %self.name, change = %change.id, "Change filtered out");
            return;
        }
        let important = self.importance.is_important(change);
        if !important && self.only_important {
            debug!(scheduler = %self.name, change = %change.id, "Dropping unimportant change");
            return;
        }
        self.got_change(change, important).await;
    }

    async fn got_change(self: &Arc<Self>, change: &Change, important: bool) {
        let _serial = self.serial.lock().await;
        if !self.lock_state().running {
            return;
        }

        let Some(interval) = self.tree_stable_timer else {
            if important {
                if let Err(e) = self.add_buildset_for_changes(&[change.id]).await {
                    error!(scheduler = %self.name, change = %change.id, error = %e, "Failed to create buildset");
                }
            }
            return;
        };

        let key = self.policy.timer_key(change);
        let classification = BTreeMap::from([(change.id, important)]);
        if let Err(e) = self
            .db
            .schedulers
            .classify_changes(self.scheduler_id, &classification)
            .await
        {
            error!(scheduler = %self.name, change = %change.id, error = %e, "Failed to classify change");
            return;
        }

        let mut state = self.lock_state();
        if !important && !state.timers.contains_key(&key) {
            return;
        }
        if let Some(old) = state.timers.remove(&key) {
            old.handle.abort();
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            inner.stable_timer_fired(timer_key, generation).await;
        });
        state.timers.insert(key, ArmedTimer { generation, handle });
        debug!(scheduler = %self.name, change = %change.id, ?interval, "Tree-stable timer armed");
    }

    async fn stable_timer_fired(&self, key: TimerKey, generation: u64) {
        let _serial = self.serial.lock().await;
        {
            let mut state = self.lock_state();
            match state.timers.get(&key) {
                Some(timer) if timer.generation == generation => {
                    state.timers.remove(&key);
                }
                // Re-armed or stopped while waiting for the serial lock.
                _ => return,
            }
        }

        let filter = self.policy.classification_filter(&key);
        let classifications = match self
            .db
            .schedulers
            .get_change_classifications(self.scheduler_id, &filter)
            .await
        {
            Ok(classifications) => classifications,
            Err(e) => {
                error!(scheduler = %self.name, error = %e, "Failed to read classified changes");
                return;
            }
        };
        let change_ids: Vec<ChangeId> = classifications.keys().copied().collect();
        let Some(newest) = change_ids.last().copied() else {
            return;
        };

        if let Err(e) = self.add_buildset_for_changes(&change_ids).await {
            error!(scheduler = %self.name, error = %e, "Failed to create buildset");
            return;
        }

        // Changes classified after the read above must survive the flush.
        let less_than = ChangeId(newest.get() + 1);
        if let Err(e) = self
            .db
            .schedulers
            .flush_change_classifications(self.scheduler_id, &filter, Some(less_than))
            .await
        {
            error!(scheduler = %self.name, error = %e, "Failed to flush classified changes");
        }
    }

    async fn add_buildset_for_changes(&self, change_ids: &[ChangeId]) -> SchedulerResult<()> {
        let mut changes = Vec::with_capacity(change_ids.len());
        for id in change_ids {
            match self.db.changes.get_change(*id).await {
                Ok(change) => changes.push(change),
                Err(DbError::NotFound(_)) => {
                    warn!(scheduler = %self.name, change = %id, "Classified change no longer exists")
                }
                Err(e) => return Err(e.into()),
            }
        }
        if changes.is_empty() {
            return Ok(());
        }

        let (buildset_id, _) = self
            .db
            .buildrequests
            .create_build_requests(NewBuildset {
                builder_names: self.builders.clone(),
                sourcestamps: SourceStamp::from_changes(&changes),
                reason: self.reason.clone(),
                priority: 0,
            })
            .await?;
        info!(
            scheduler = %self.name,
            buildset = %buildset_id,
            changes = ?change_ids,
            "Created buildset"
        );

        let event = BuildRequestEvent::New {
            builder_names: self.builders.clone(),
        };
        if self.events.send(event).is_err() {
            debug!(scheduler = %self.name, "No one is listening for build requests");
        }
        Ok(())
    }

    async fn scan_existing_classified_changes(self: &Arc<Self>) {
        let classifications = match self
            .db
            .schedulers
            .get_change_classifications(self.scheduler_id, &ClassificationFilter::All)
            .await
        {
            Ok(classifications) => classifications,
            Err(e) => {
                error!(scheduler = %self.name, error = %e, "Failed to read classified changes");
                return;
            }
        };
        if !classifications.is_empty() {
            info!(
                scheduler = %self.name,
                count = classifications.len(),
                "Recovering classified changes"
            );
        }

        for (id, important) in classifications {
            match self.db.changes.get_change(id).await {
                Ok(change) => self.got_change(&change, important).await,
                Err(DbError::NotFound(_)) => {
                    warn!(scheduler = %self.name, change = %id, "Classified change no longer exists")
                }
                Err(e) => {
                    error!(scheduler = %self.name, change = %id, error = %e, "Failed to load change")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmaster_db::{ChangeRepo, MemoryDb, SchedulerRepo};

    struct Harness {
        memory: Arc<MemoryDb>,
        classifier: ChangeClassifier,
        events: mpsc::UnboundedReceiver<BuildRequestEvent>,
        changes: broadcast::Sender<Change>,
    }

    impl Harness {
        fn new(config: SchedulerConfig) -> Self {
            Self::with_db(config, Arc::new(MemoryDb::new()))
        }

        fn with_db(config: SchedulerConfig, memory: Arc<MemoryDb>) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let classifier = ChangeClassifier::from_config(
                &config,
                SchedulerId(1),
                Database::in_memory(memory.clone()),
                tx,
            )
            .unwrap();
            let (changes, _) = broadcast::channel(64);
            Self {
                memory,
                classifier,
                events,
                changes,
            }
        }

        async fn start(&self) {
            self.classifier.start(self.changes.subscribe()).await;
        }

        /// Store a change and publish it, like a change source would. The
        /// short sleep lets the listener finish with it before time moves.
        async fn push(&self, change: Change) -> Change {
            let change = self.memory.add_change(change).await.unwrap();
            self.changes.send(change.clone()).unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            change
        }
    }

    fn config(timer: Option<u64>) -> SchedulerConfig {
        let mut config = SchedulerConfig::new("main", SchedulerKind::SingleBranch);
        config.builders = vec!["linux".to_string()];
        config.tree_stable_timer = timer.map(Duration::from_secs);
        config.file_is_important = vec![r"\.rs$".to_string()];
        config
    }

    fn source_change(branch: &str) -> Change {
        Change::new(0).with_branch(branch).with_files(["src/lib.rs"])
    }

    fn docs_change(branch: &str) -> Change {
        Change::new(0).with_branch(branch).with_files(["README.md"])
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tree_stable_timer_debounces() {
        let harness = Harness::new(config(Some(60)));
        harness.start().await;

        let c1 = harness.push(docs_change("main")).await;
        assert_eq!(harness.classifier.pending_timers(), 0);
        sleep_secs(10).await;
        let c2 = harness.push(source_change("main")).await;
        sleep_secs(10).await;
        let c3 = harness.push(source_change("main")).await;
        assert_eq!(harness.classifier.pending_timers(), 1);

        // 59s after c3: the timer armed by c2 would have fired already.
        sleep_secs(59).await;
        assert!(harness.memory.buildsets().await.is_empty());

        sleep_secs(2).await;
        let buildsets = harness.memory.buildsets().await;
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].builder_names, vec!["linux"]);
        assert_eq!(buildsets[0].sourcestamps[0].changes, vec![c1.id, c2.id, c3.id]);

        let left = harness
            .memory
            .get_change_classifications(SchedulerId(1), &ClassificationFilter::All)
            .await
            .unwrap();
        assert!(left.is_empty());
        assert_eq!(harness.classifier.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buildset_notifies_builders() {
        let mut harness = Harness::new(config(Some(5)));
        harness.start().await;
        harness.push(source_change("main")).await;
        sleep_secs(6).await;

        assert_eq!(
            harness.events.try_recv().unwrap(),
            BuildRequestEvent::New {
                builder_names: vec!["linux".to_string()]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unimportant_change_alone_arms_nothing() {
        let harness = Harness::new(config(Some(5)));
        harness.start().await;
        let docs = harness.push(docs_change("main")).await;
        sleep_secs(60).await;

        assert!(harness.memory.buildsets().await.is_empty());
        // Still classified, so a later important change picks it up.
        let classified = harness
            .memory
            .get_change_classifications(SchedulerId(1), &ClassificationFilter::All)
            .await
            .unwrap();
        assert_eq!(classified, BTreeMap::from([(docs.id, false)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_timer_builds_each_important_change() {
        let harness = Harness::new(config(None));
        harness.start().await;
        let a = harness.push(source_change("main")).await;
        harness.push(docs_change("main")).await;
        let b = harness.push(source_change("main")).await;

        let buildsets = harness.memory.buildsets().await;
        let built: Vec<_> = buildsets
            .iter()
            .map(|bs| bs.sourcestamps[0].changes.clone())
            .collect();
        assert_eq!(built, vec![vec![a.id], vec![b.id]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_important_drops_the_rest() {
        let mut config = config(Some(5));
        config.only_important = true;
        let harness = Harness::new(config);
        harness.start().await;
        harness.push(docs_change("main")).await;
        let code = harness.push(source_change("main")).await;
        sleep_secs(6).await;

        let buildsets = harness.memory.buildsets().await;
        assert_eq!(buildsets[0].sourcestamps[0].changes, vec![code.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_ignores_other_branches() {
        let mut config = config(Some(5));
        config.filter.branch = StringMatcher::OneOf(vec!["main".to_string()]);
        let harness = Harness::new(config);
        harness.start().await;
        harness.push(source_change("feature")).await;
        sleep_secs(6).await;

        assert!(harness.memory.buildsets().await.is_empty());
        assert_eq!(harness.classifier.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_branch_keeps_branches_apart() {
        let mut config = config(Some(30));
        config.kind = SchedulerKind::AnyBranch;
        let harness = Harness::new(config);
        harness.start().await;

        let main = harness.push(source_change("main")).await;
        sleep_secs(20).await;
        let dev = harness.push(source_change("dev")).await;
        assert_eq!(harness.classifier.pending_timers(), 2);

        // main fires; dev's classification must survive the flush.
        sleep_secs(15).await;
        let buildsets = harness.memory.buildsets().await;
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].sourcestamps[0].changes, vec![main.id]);

        sleep_secs(20).await;
        let buildsets = harness.memory.buildsets().await;
        assert_eq!(buildsets.len(), 2);
        assert_eq!(buildsets[1].sourcestamps[0].changes, vec![dev.id]);
        assert_eq!(buildsets[1].sourcestamps[0].branch.as_deref(), Some("dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovers_classified_changes() {
        let memory = Arc::new(MemoryDb::new());
        let c1 = memory.add_change(source_change("main")).await.unwrap();
        let c2 = memory.add_change(docs_change("main")).await.unwrap();
        memory
            .classify_changes(SchedulerId(1), &BTreeMap::from([(c1.id, true), (c2.id, false)]))
            .await
            .unwrap();

        let harness = Harness::with_db(config(Some(60)), memory);
        harness.start().await;
        assert_eq!(harness.classifier.pending_timers(), 1);

        sleep_secs(61).await;
        let buildsets = harness.memory.buildsets().await;
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].sourcestamps[0].changes, vec![c1.id, c2.id]);

        sleep_secs(120).await;
        assert_eq!(harness.memory.buildsets().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_database_failure_is_logged_not_fatal() {
        let harness = Harness::new(config(Some(5)));
        harness.start().await;
        let change = harness.memory.add_change(source_change("main")).await.unwrap();

        harness.memory.set_unavailable(true);
        harness.classifier.handle_change(&change).await;
        assert_eq!(harness.classifier.pending_timers(), 0);

        harness.memory.set_unavailable(false);
        harness.classifier.handle_change(&change).await;
        sleep_secs(6).await;
        assert_eq!(harness.memory.buildsets().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timers() {
        let harness = Harness::new(config(Some(5)));
        harness.start().await;
        harness.push(source_change("main")).await;
        harness.classifier.stop().await;
        sleep_secs(10).await;

        assert!(harness.memory.buildsets().await.is_empty());
        assert!(!harness.classifier.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_importance() {
        let memory = Arc::new(MemoryDb::new());
        let (tx, _events) = mpsc::unbounded_channel();
        let classifier = ChangeClassifier::from_config(
            &config(None),
            SchedulerId(1),
            Database::in_memory(memory.clone()),
            tx,
        )
        .unwrap()
        .with_importance(Importance::Custom(Arc::new(|change: &Change| {
            change.comments.contains("[build]")
        })));
        let (changes, _) = broadcast::channel(4);
        classifier.start(changes.subscribe()).await;

        let mut quiet = Change::new(0).with_files(["src/lib.rs"]);
        quiet.comments = "refactor".to_string();
        let mut loud = Change::new(0);
        loud.comments = "please [build]".to_string();
        let quiet = memory.add_change(quiet).await.unwrap();
        let loud = memory.add_change(loud).await.unwrap();
        classifier.handle_change(&quiet).await;
        classifier.handle_change(&loud).await;

        let buildsets = memory.buildsets().await;
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].sourcestamps[0].changes, vec![loud.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_filter_predicate() {
        let memory = Arc::new(MemoryDb::new());
        let (tx, _events) = mpsc::unbounded_channel();
        let classifier = ChangeClassifier::load(
            &config(None),
            Database::in_memory(memory.clone()),
            tx,
        )
        .await
        .unwrap()
        .with_filter(
            ChangeFilter::any()
                .with_predicate(Arc::new(|change: &Change| change.author != "bot")),
        );
        let (changes, _) = broadcast::channel(4);
        classifier.start(changes.subscribe()).await;

        let mut by_bot = source_change("main");
        by_bot.author = "bot".to_string();
        let by_bot = memory.add_change(by_bot).await.unwrap();
        let by_human = memory.add_change(source_change("main")).await.unwrap();
        classifier.handle_change(&by_bot).await;
        classifier.handle_change(&by_human).await;

        let buildsets = memory.buildsets().await;
        assert_eq!(buildsets.len(), 1);
        assert_eq!(buildsets[0].sourcestamps[0].changes, vec![by_human.id]);
    }
}
