//! # Supervisor
//!
//! The runner-facing side of the control plane. Runners look up their current
//! upstream context and downstream sender whenever they apply a command, and
//! report completion or failure.
//!
//! [`PipelineRegistry`] is the implementation used by the engine. Lookups read
//! `ArcSwap` snapshots and never wait on the control thread; notifications are
//! queued to it over a crossbeam channel. A runner can therefore call into the
//! supervisor while the control thread is blocked waiting for that runner to
//! acknowledge a command.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use tracing::warn;

use super::{DownstreamSender, PipelineId, PipelineReplicaId, UpstreamContext};

pub trait Supervisor: Send + Sync {
    fn get_upstream_context(&self, id: PipelineReplicaId) -> Result<Arc<UpstreamContext>>;

    fn get_downstream_sender(&self, id: PipelineReplicaId) -> Result<Arc<DownstreamSender>>;

    fn notify_pipeline_replica_completed(&self, id: PipelineReplicaId);

    fn notify_pipeline_replica_failed(&self, id: PipelineReplicaId, error: anyhow::Error);
}

/// Runner report delivered to the control thread.
#[derive(Debug)]
pub enum ReplicaNotification {
    Completed(PipelineReplicaId),
    Failed(PipelineReplicaId, anyhow::Error),
}

/// Current upstream context and per-replica senders of one pipeline.
#[derive(Debug)]
pub struct PipelineWiring {
    upstream_context: ArcSwap<UpstreamContext>,
    senders: ArcSwap<Vec<Arc<DownstreamSender>>>,
}

impl PipelineWiring {
    pub fn new(upstream_context: Arc<UpstreamContext>, senders: Vec<Arc<DownstreamSender>>) -> Self {
        Self {
            upstream_context: ArcSwap::new(upstream_context),
            senders: ArcSwap::from_pointee(senders),
        }
    }

    pub fn upstream_context(&self) -> Arc<UpstreamContext> {
        self.upstream_context.load_full()
    }

    pub fn set_upstream_context(&self, upstream_context: Arc<UpstreamContext>) {
        self.upstream_context.store(upstream_context);
    }

    pub fn senders(&self) -> Arc<Vec<Arc<DownstreamSender>>> {
        self.senders.load_full()
    }

    pub fn set_senders(&self, senders: Vec<Arc<DownstreamSender>>) {
        self.senders.store(Arc::new(senders));
    }
}

/// Shared table of pipeline wirings, implementing [`Supervisor`].
#[derive(Debug)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<PipelineId, Arc<PipelineWiring>>>,
    notifications: Sender<ReplicaNotification>,
}

impl PipelineRegistry {
    pub fn new(notifications: Sender<ReplicaNotification>) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            notifications,
        }
    }

    /// Registers or replaces the wiring of `id`.
    pub fn register(&self, id: PipelineId, wiring: PipelineWiring) -> Arc<PipelineWiring> {
        let wiring = Arc::new(wiring);
        self.pipelines
            .write()
            .expect("pipeline registry poisoned")
            .insert(id, Arc::clone(&wiring));
        wiring
    }

    pub fn unregister(&self, id: PipelineId) -> Option<Arc<PipelineWiring>> {
        self.pipelines
            .write()
            .expect("pipeline registry poisoned")
            .remove(&id)
    }

    pub fn wiring(&self, id: PipelineId) -> Result<Arc<PipelineWiring>> {
        self.pipelines
            .read()
            .expect("pipeline registry poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("pipeline {} is not registered", id))
    }

    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        let mut ids: Vec<PipelineId> = self
            .pipelines
            .read()
            .expect("pipeline registry poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    fn notify(&self, notification: ReplicaNotification) {
        if let Err(err) = self.notifications.send(notification) {
            warn!(notification = ?err.0, "control thread is gone, dropping notification");
        }
    }
}

impl Supervisor for PipelineRegistry {
    fn get_upstream_context(&self, id: PipelineReplicaId) -> Result<Arc<UpstreamContext>> {
        Ok(self.wiring(id.pipeline_id)?.upstream_context())
    }

    fn get_downstream_sender(&self, id: PipelineReplicaId) -> Result<Arc<DownstreamSender>> {
        let senders = self.wiring(id.pipeline_id)?.senders();
        senders
            .get(id.replica_index)
            .cloned()
            .ok_or_else(|| anyhow!("pipeline replica {} has no downstream sender", id))
    }

    fn notify_pipeline_replica_completed(&self, id: PipelineReplicaId) {
        self.notify(ReplicaNotification::Completed(id));
    }

    fn notify_pipeline_replica_failed(&self, id: PipelineReplicaId, error: anyhow::Error) {
        self.notify(ReplicaNotification::Failed(id, error));
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
