//! Runtime state of a builder: which request to run next and where.

use buildmaster_config::{BuilderConfig, NextWorkerKind};
use buildmaster_core::BuildRequest;
use buildmaster_core::change::stamps_equivalent;
use std::collections::HashMap;

use crate::worker::Worker;
use crate::worker_slot::{SlotId, SlotTable, WorkerSlot};

#[derive(Debug, Clone)]
pub struct Builder {
    pub config: BuilderConfig,
}

impl Builder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The pending request that should start first: highest priority, then
    /// oldest, then lowest id.
    pub fn choose_request<'a>(&self, pending: &'a [BuildRequest]) -> Option<&'a BuildRequest> {
        pending
            .iter()
            .filter(|br| br.builder_name == self.config.name && !br.is_claimed() && !br.complete)
            .min_by_key(|br| br.start_order_key())
    }

    /// Requests that start together with `chosen`. Without collapsing this
    /// is just `chosen`; with it, every pending request on equivalent
    /// source stamps joins the build.
    pub fn collapse<'a>(
        &self,
        chosen: &'a BuildRequest,
        pending: &'a [BuildRequest],
    ) -> Vec<&'a BuildRequest> {
        let mut requests = vec![chosen];
        if self.config.collapse_requests {
            requests.extend(pending.iter().filter(|br| {
                br.id != chosen.id
                    && br.builder_name == chosen.builder_name
                    && !br.is_claimed()
                    && !br.complete
                    && stamps_equivalent(&br.sourcestamps, &chosen.sourcestamps)
            }));
        }
        requests
    }

    /// Pick an available slot of this builder according to its next-worker
    /// policy. Never returns a busy slot.
    pub fn next_worker(&self, slots: &SlotTable, workers: &HashMap<String, Worker>) -> Option<SlotId> {
        let mut available: Vec<(&WorkerSlot, &Worker)> = slots
            .for_builder(&self.config.name)
            .filter_map(|slot| {
                let worker = workers.get(slot.worker_name())?;
                slot.is_available(worker).then_some((slot, worker))
            })
            .collect();

        match self.config.next_worker {
            // Stable sort keeps attach order within each group.
            NextWorkerKind::First => available.sort_by_key(|(slot, _)| slot.is_latent()),
            NextWorkerKind::LeastLoaded => {
                available.sort_by_key(|(slot, worker)| (worker.running_builds(), slot.is_latent()))
            }
        }
        available.first().map(|(slot, _)| slot.id())
    }
}
