//! In-memory implementation of every repository.
//!
//! Used by tests and single-process masters. Can be switched into an
//! "unavailable" mode where every call fails, to exercise the callers'
//! error paths.

use async_trait::async_trait;
use buildmaster_core::{
    BuildRequest, BuildRequestId, BuildResult, BuildsetId, Change, ChangeId, MasterId,
    SchedulerId, SourceStamp,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

use crate::repo::{
    BuildRequestRepo, ChangeRepo, ClassificationFilter, NewBuildset, SchedulerRepo,
};
use crate::{DbError, DbResult};

/// A buildset as recorded by [`MemoryDb`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuildsetRecord {
    pub id: BuildsetId,
    pub builder_names: Vec<String>,
    pub sourcestamps: Vec<SourceStamp>,
    pub reason: String,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    changes: BTreeMap<ChangeId, Change>,
    buildsets: Vec<BuildsetRecord>,
    buildrequests: BTreeMap<BuildRequestId, BuildRequest>,
    classifications: HashMap<SchedulerId, BTreeMap<ChangeId, bool>>,
    schedulers: HashMap<String, SchedulerId>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn selected(&self, filter: &ClassificationFilter, id: ChangeId) -> bool {
        match filter {
            ClassificationFilter::All => true,
            ClassificationFilter::Matching(key) => {
                self.changes.get(&id).is_some_and(|change| key.matches(change))
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`DbError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every buildset created so far, in creation order.
    pub async fn buildsets(&self) -> Vec<BuildsetRecord> {
        self.state.lock().await.buildsets.clone()
    }

    /// Every build request, in id order.
    pub async fn build_requests(&self) -> Vec<BuildRequest> {
        self.state.lock().await.buildrequests.values().cloned().collect()
    }

    async fn state(&self) -> DbResult<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("in-memory database is offline".to_string()));
        }
        Ok(self.state.lock().await)
    }
}

#[async_trait]
impl ChangeRepo for MemoryDb {
    async fn add_change(&self, mut change: Change) -> DbResult<Change> {
        let mut state = self.state().await?;
        change.id = ChangeId(state.next_id());
        state.changes.insert(change.id, change.clone());
        Ok(change)
    }

    async fn get_change(&self, id: ChangeId) -> DbResult<Change> {
        self.state()
            .await?
            .changes
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("change {}", id)))
    }
}

#[async_trait]
impl BuildRequestRepo for MemoryDb {
    async fn create_build_requests(
        &self,
        buildset: NewBuildset,
    ) -> DbResult<(BuildsetId, BTreeMap<String, BuildRequestId>)> {
        let mut state = self.state().await?;
        let buildset_id = BuildsetId(state.next_id());
        let now = Utc::now();

        let mut requests = BTreeMap::new();
        for builder_name in &buildset.builder_names {
            let id = BuildRequestId(state.next_id());
            state.buildrequests.insert(
                id,
                BuildRequest {
                    id,
                    buildset_id,
                    builder_name: builder_name.clone(),
                    priority: buildset.priority,
                    submitted_at: now,
                    claimed_by: None,
                    claimed_at: None,
                    complete: false,
                    results: None,
                    reason: buildset.reason.clone(),
                    sourcestamps: buildset.sourcestamps.clone(),
                },
            );
            requests.insert(builder_name.clone(), id);
        }

        state.buildsets.push(BuildsetRecord {
            id: buildset_id,
            builder_names: buildset.builder_names,
            sourcestamps: buildset.sourcestamps,
            reason: buildset.reason,
        });
        Ok((buildset_id, requests))
    }

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        master: MasterId,
    ) -> DbResult<bool> {
        let mut state = self.state().await?;
        let claimable = ids.iter().all(|id| {
            state
                .buildrequests
                .get(id)
                .is_some_and(|br| !br.is_claimed() && !br.complete)
        });
        if !claimable {
            return Ok(false);
        }

        let now = Utc::now();
        for id in ids {
            if let Some(br) = state.buildrequests.get_mut(id) {
                br.claimed_by = Some(master);
                br.claimed_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn unclaim_build_requests(
        &self,
        ids: &[BuildRequestId],
        master: MasterId,
    ) -> DbResult<()> {
        let mut state = self.state().await?;
        for id in ids {
            if let Some(br) = state.buildrequests.get_mut(id) {
                if br.claimed_by == Some(master) && !br.complete {
                    br.claimed_by = None;
                    br.claimed_at = None;
                }
            }
        }
        Ok(())
    }

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        result: BuildResult,
    ) -> DbResult<()> {
        let mut state = self.state().await?;
        for id in ids {
            if let Some(br) = state.buildrequests.get_mut(id) {
                br.complete = true;
                br.results = Some(result);
            }
        }
        Ok(())
    }

    async fn get_unclaimed_build_requests(
        &self,
        builder_name: &str,
    ) -> DbResult<Vec<BuildRequest>> {
        let state = self.state().await?;
        let mut requests: Vec<BuildRequest> = state
            .buildrequests
            .values()
            .filter(|br| br.builder_name == builder_name && !br.is_claimed() && !br.complete)
            .cloned()
            .collect();
        requests.sort_by_key(|br| br.start_order_key());
        Ok(requests)
    }

    async fn get_build_request(&self, id: BuildRequestId) -> DbResult<BuildRequest> {
        self.state()
            .await?
            .buildrequests
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build request {}", id)))
    }
}

#[async_trait]
impl SchedulerRepo for MemoryDb {
    async fn find_scheduler_id(&self, name: &str) -> DbResult<SchedulerId> {
        let mut state = self.state().await?;
        if let Some(id) = state.schedulers.get(name) {
            return Ok(*id);
        }
        let id = SchedulerId(state.next_id());
        state.schedulers.insert(name.to_string(), id);
        Ok(id)
    }

    async fn classify_changes(
        &self,
        scheduler: SchedulerId,
        classifications: &BTreeMap<ChangeId, bool>,
    ) -> DbResult<()> {
        let mut state = self.state().await?;
        state
            .classifications
            .entry(scheduler)
            .or_default()
            .extend(classifications.iter().map(|(id, important)| (*id, *important)));
        Ok(())
    }

    async fn get_change_classifications(
        &self,
        scheduler: SchedulerId,
        filter: &ClassificationFilter,
    ) -> DbResult<BTreeMap<ChangeId, bool>> {
        let state = self.state().await?;
        let Some(classified) = state.classifications.get(&scheduler) else {
            return Ok(BTreeMap::new());
        };
        Ok(classified
            .iter()
            .filter(|(id, _)| state.selected(filter, **id))
            .map(|(id, important)| (*id, *important))
            .collect())
    }

    async fn flush_change_classifications(
        &self,
        scheduler: SchedulerId,
        filter: &ClassificationFilter,
        less_than: Option<ChangeId>,
    ) -> DbResult<()> {
        let mut state = self.state().await?;
        let Some(classified) = state.classifications.get(&scheduler) else {
            return Ok(());
        };
        let doomed: Vec<ChangeId> = classified
            .keys()
            .copied()
            .filter(|id| less_than.is_none_or(|limit| *id < limit))
            .filter(|id| state.selected(filter, *id))
            .collect();
        if let Some(classified) = state.classifications.get_mut(&scheduler) {
            for id in doomed {
                classified.remove(&id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buildset(builders: &[&str]) -> NewBuildset {
        NewBuildset {
            builder_names: builders.iter().map(|b| b.to_string()).collect(),
            sourcestamps: vec![],
            reason: "test".to_string(),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_between_masters() {
        let db = MemoryDb::new();
        let (_, ids) = db.create_build_requests(buildset(&["linux"])).await.unwrap();
        let id = ids["linux"];

        assert!(db.claim_build_requests(&[id], MasterId(1)).await.unwrap());
        assert!(!db.claim_build_requests(&[id], MasterId(2)).await.unwrap());
        assert!(db.get_unclaimed_build_requests("linux").await.unwrap().is_empty());

        // Only the owner can give the claim back.
        db.unclaim_build_requests(&[id], MasterId(2)).await.unwrap();
        assert!(db.get_unclaimed_build_requests("linux").await.unwrap().is_empty());
        db.unclaim_build_requests(&[id], MasterId(1)).await.unwrap();
        assert_eq!(db.get_unclaimed_build_requests("linux").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_all_or_nothing() {
        let db = MemoryDb::new();
        let (_, first) = db.create_build_requests(buildset(&["linux"])).await.unwrap();
        let (_, second) = db.create_build_requests(buildset(&["linux"])).await.unwrap();

        assert!(db.claim_build_requests(&[second["linux"]], MasterId(2)).await.unwrap());
        assert!(
            !db.claim_build_requests(&[first["linux"], second["linux"]], MasterId(1))
                .await
                .unwrap()
        );
        let first = db.get_build_request(first["linux"]).await.unwrap();
        assert!(!first.is_claimed());
    }

    #[tokio::test]
    async fn test_completed_requests_are_not_pending() {
        let db = MemoryDb::new();
        let (_, ids) = db.create_build_requests(buildset(&["a", "b"])).await.unwrap();
        db.complete_build_requests(&[ids["a"]], BuildResult::Success)
            .await
            .unwrap();

        assert!(db.get_unclaimed_build_requests("a").await.unwrap().is_empty());
        assert_eq!(db.get_unclaimed_build_requests("b").await.unwrap().len(), 1);
        assert!(!db.claim_build_requests(&[ids["a"]], MasterId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_classifications_flush_below_limit() {
        let db = MemoryDb::new();
        let scheduler = SchedulerId(1);
        let classified: BTreeMap<_, _> =
            [(ChangeId(1), true), (ChangeId(2), false), (ChangeId(5), true)].into();
        db.classify_changes(scheduler, &classified).await.unwrap();

        db.flush_change_classifications(scheduler, &ClassificationFilter::All, Some(ChangeId(3)))
            .await
            .unwrap();
        let left = db
            .get_change_classifications(scheduler, &ClassificationFilter::All)
            .await
            .unwrap();
        assert_eq!(left, BTreeMap::from([(ChangeId(5), true)]));
    }

    #[tokio::test]
    async fn test_classifications_filtered_by_change_key() {
        let db = MemoryDb::new();
        let main = db.add_change(Change::new(0).with_branch("main")).await.unwrap();
        let dev = db.add_change(Change::new(0).with_branch("dev")).await.unwrap();
        let scheduler = SchedulerId(3);
        db.classify_changes(scheduler, &BTreeMap::from([(main.id, true), (dev.id, true)]))
            .await
            .unwrap();

        let only_main = db
            .get_change_classifications(scheduler, &ClassificationFilter::Matching(main.key()))
            .await
            .unwrap();
        assert_eq!(only_main.keys().copied().collect::<Vec<_>>(), vec![main.id]);

        db.flush_change_classifications(
            scheduler,
            &ClassificationFilter::Matching(main.key()),
            None,
        )
        .await
        .unwrap();
        let left = db
            .get_change_classifications(scheduler, &ClassificationFilter::All)
            .await
            .unwrap();
        assert_eq!(left.keys().copied().collect::<Vec<_>>(), vec![dev.id]);
    }

    #[tokio::test]
    async fn test_scheduler_ids_are_stable_per_name() {
        let db = MemoryDb::new();
        let main = db.find_scheduler_id("main").await.unwrap();
        let nightly = db.find_scheduler_id("nightly").await.unwrap();
        assert_ne!(main, nightly);
        assert_eq!(db.find_scheduler_id("main").await.unwrap(), main);
    }

    #[tokio::test]
    async fn test_unavailable_database_fails_every_call() {
        let db = MemoryDb::new();
        db.set_unavailable(true);
        assert!(matches!(
            db.get_unclaimed_build_requests("linux").await,
            Err(DbError::Unavailable(_))
        ));
        db.set_unavailable(false);
        assert!(db.get_unclaimed_build_requests("linux").await.is_ok());
    }
}
