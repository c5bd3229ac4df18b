// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the patch worker and the topology provider.

use async_trait::async_trait;
use patch_dispatcher_types::descriptor::{CallDescriptor, ClusterRef};
use patch_dispatcher_types::fabric::{ClusterId, FabricId};
use patch_dispatcher_types::request::RequestStatus;
use patch_dispatcher_types::{ChildRequestUuid, MasterJobUuid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One unit of work handed to the worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub master_job: MasterJobUuid,
    pub fabric_id: FabricId,
    pub cluster_id: ClusterId,
    pub cluster_name: String,
    /// Already restricted to either switch or non-switch targets.
    pub call: CallDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: RequestStatus,
    pub correlation_id: ChildRequestUuid,
    /// `None` when the worker accepted the request.
    pub error: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to reach patch worker")]
    Transport(#[source] anyhow::Error),
    #[error("patch worker rejected request: {0}")]
    Rejected(String),
}

/// Executes patch work on behalf of the dispatcher.
///
/// `submit` returns as soon as the worker has recorded the request; the
/// request's progress is then tracked through the lock store's request
/// table.
#[async_trait]
pub trait PatchWorker: Send + Sync {
    async fn submit(
        &self,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, WorkerError>;
}

/// What the topology provider knows about one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub cluster_name: String,
    /// Switch hostnames, short or qualified.
    pub switches: Vec<String>,
    /// Domain used to qualify short switch hostnames.
    pub domain: String,
}

impl ClusterTopology {
    /// Switch hostnames qualified with the cluster's domain.
    pub fn qualified_switches(&self) -> Vec<String> {
        self.switches
            .iter()
            .map(|switch| {
                let short = switch.split('.').next().unwrap_or(switch);
                if self.domain.is_empty() {
                    short.to_string()
                } else {
                    format!("{short}.{}", self.domain)
                }
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no topology for cluster {0:?}")]
    UnknownCluster(String),
    #[error("failed to read topology for cluster {cluster:?}")]
    Unavailable {
        cluster: String,
        #[source]
        err: anyhow::Error,
    },
}

#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn cluster_topology(
        &self,
        cluster: &ClusterRef,
    ) -> Result<ClusterTopology, TopologyError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn switches_take_cluster_domain() {
        let topology = ClusterTopology {
            cluster_name: "c1".to_string(),
            switches: vec![
                "sw-a".to_string(),
                "sw-b.stale.example.com".to_string(),
            ],
            domain: "rack1.example.com".to_string(),
        };
        assert_eq!(
            topology.qualified_switches(),
            ["sw-a.rack1.example.com", "sw-b.rack1.example.com"]
        );
    }
}
