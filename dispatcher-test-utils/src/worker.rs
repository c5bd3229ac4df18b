// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::store::MemoryLockStore;
use async_trait::async_trait;
use patch_dispatcher::worker::{
    ClusterTopology, PatchWorker, TopologyError, TopologyProvider,
    WorkerError, WorkerRequest, WorkerResponse,
};
use patch_dispatcher_types::descriptor::ClusterRef;
use patch_dispatcher_types::request::{
    ChildRequestRow, RequestStatus, WORKER_ERROR_UNDEF,
};
use patch_dispatcher_types::ChildRequestUuid;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// What the fake worker does with one submission.
#[derive(Clone, Debug)]
pub enum WorkerBehavior {
    /// Accept the request and report `status` with `error` once the request
    /// row has been read `running_polls` times.
    Finish { running_polls: u32, status: RequestStatus, error: String },
    /// Accept the request and never finish it.
    Hang,
    /// Answer with this response without recording anything.
    Respond(WorkerResponse),
    /// Fail as if the worker could not be reached.
    Unreachable,
}

impl WorkerBehavior {
    /// Finishes cleanly on the first poll.
    pub fn done() -> WorkerBehavior {
        WorkerBehavior::Finish {
            running_polls: 0,
            status: RequestStatus::Done,
            error: "0".to_string(),
        }
    }
}

struct FakeWorkerInner {
    default: WorkerBehavior,
    queued: VecDeque<WorkerBehavior>,
    submitted: Vec<(WorkerRequest, ChildRequestUuid)>,
}

/// A fake patch worker that records its requests in a [`MemoryLockStore`].
#[derive(Clone)]
pub struct FakeWorker {
    store: MemoryLockStore,
    inner: Arc<Mutex<FakeWorkerInner>>,
}

impl FakeWorker {
    pub fn new(store: MemoryLockStore) -> Self {
        FakeWorker {
            store,
            inner: Arc::new(Mutex::new(FakeWorkerInner {
                default: WorkerBehavior::done(),
                queued: VecDeque::new(),
                submitted: Vec::new(),
            })),
        }
    }

    /// Behavior for submissions with nothing queued.
    pub fn set_default(&self, behavior: WorkerBehavior) {
        self.inner.lock().unwrap().default = behavior;
    }

    /// Behavior for the next submission only.
    pub fn push(&self, behavior: WorkerBehavior) {
        self.inner.lock().unwrap().queued.push_back(behavior);
    }

    /// Every request submitted so far, with the correlation id it got.
    pub fn submitted(&self) -> Vec<(WorkerRequest, ChildRequestUuid)> {
        self.inner.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl PatchWorker for FakeWorker {
    async fn submit(
        &self,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, WorkerError> {
        let behavior = {
            let mut inner = self.inner.lock().unwrap();
            inner.queued.pop_front().unwrap_or_else(|| inner.default.clone())
        };
        let correlation_id = match &behavior {
            WorkerBehavior::Respond(response) => response.correlation_id,
            WorkerBehavior::Unreachable => ChildRequestUuid::nil(),
            _ => ChildRequestUuid::new_v4(),
        };
        self.inner
            .lock()
            .unwrap()
            .submitted
            .push((request.clone(), correlation_id));

        let running = ChildRequestRow {
            correlation_id,
            status: RequestStatus::Pending,
            error: WORKER_ERROR_UNDEF.to_string(),
            error_detail: WORKER_ERROR_UNDEF.to_string(),
        };
        match behavior {
            WorkerBehavior::Finish { running_polls, status, error } => {
                let finished = ChildRequestRow {
                    status,
                    error,
                    error_detail: String::new(),
                    ..running.clone()
                };
                self.store.script_child(running, Some((running_polls, finished)));
            }
            WorkerBehavior::Hang => self.store.script_child(running, None),
            WorkerBehavior::Respond(response) => return Ok(response),
            WorkerBehavior::Unreachable => {
                return Err(WorkerError::Transport(anyhow::anyhow!(
                    "connection refused"
                )));
            }
        }
        Ok(WorkerResponse {
            status: RequestStatus::Pending,
            correlation_id,
            error: None,
            error_detail: None,
        })
    }
}

/// A topology provider backed by a map from topology name to topology.
#[derive(Clone, Default)]
pub struct FakeTopology {
    clusters: Arc<Mutex<BTreeMap<String, ClusterTopology>>>,
}

impl FakeTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the topology known as `topology`.
    pub fn set_cluster(
        &self,
        topology: &str,
        cluster_name: &str,
        switches: &[&str],
        domain: &str,
    ) {
        self.clusters.lock().unwrap().insert(
            topology.to_string(),
            ClusterTopology {
                cluster_name: cluster_name.to_string(),
                switches: switches.iter().map(|s| s.to_string()).collect(),
                domain: domain.to_string(),
            },
        );
    }
}

#[async_trait]
impl TopologyProvider for FakeTopology {
    async fn cluster_topology(
        &self,
        cluster: &ClusterRef,
    ) -> Result<ClusterTopology, TopologyError> {
        self.clusters
            .lock()
            .unwrap()
            .get(&cluster.topology)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownCluster(cluster.topology.clone()))
    }
}
