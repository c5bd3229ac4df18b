// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolves every cluster of a run to its fabric, registering both in the
//! lock store as needed.
//!
//! A fabric is identified by the hash of its switch set. When the switch set
//! of a known fabric changes, the hash no longer matches and the fabric is
//! found again through any switch it shares with the stored row.

use crate::store::{LockStore, StoreError};
use crate::worker::{TopologyError, TopologyProvider};
use patch_dispatcher_types::descriptor::CallDescriptor;
use patch_dispatcher_types::fabric::{
    fabric_hash, ClusterId, FabricId, FabricRow,
};
use slog::{debug, error, info, o, warn, Logger};
use std::sync::Arc;
use thiserror::Error;

/// A fabric as this run sees it.
#[derive(Clone, Debug)]
pub struct Fabric {
    pub row: FabricRow,
    /// Qualified switch hostnames last observed through a member cluster.
    pub switches: Vec<String>,
    pub clusters: Vec<Cluster>,
}

impl Fabric {
    fn new(row: FabricRow) -> Fabric {
        Fabric { row, switches: Vec::new(), clusters: Vec::new() }
    }

    pub fn id(&self) -> FabricId {
        self.row.id
    }

    /// Whether `cluster` is in the fabric's busy list.
    pub fn holds(&self, cluster: ClusterId) -> bool {
        self.row.lock.busy_clusters.contains(&cluster)
    }

    /// The first member cluster with switch work in its request.
    pub fn first_switch_cluster(&self) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.call.targets_switch())
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }
}

/// A cluster registered in the lock store for this run.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub fabric_id: FabricId,
    pub call: CallDescriptor,
    pub switches: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PopulateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no usable switch data for cluster {cluster:?}")]
    InvalidSwitchData {
        cluster: String,
        #[source]
        err: Option<TopologyError>,
    },
}

pub struct FabricClusterRegistry {
    log: Logger,
    store: Arc<dyn LockStore>,
    topology: Arc<dyn TopologyProvider>,
}

impl FabricClusterRegistry {
    pub fn new(
        log: &Logger,
        store: Arc<dyn LockStore>,
        topology: Arc<dyn TopologyProvider>,
    ) -> Self {
        let log = log.new(o!("component" => "FabricClusterRegistry"));
        FabricClusterRegistry { log, store, topology }
    }

    /// Adds the fabric and cluster of every call to `fabrics`.
    ///
    /// Clusters whose fabric or cluster row cannot be resolved are skipped.
    /// Bad switch data from the topology provider aborts the whole run.
    pub async fn populate(
        &self,
        calls: &[CallDescriptor],
        fabrics: &mut Vec<Fabric>,
    ) -> Result<(), PopulateError> {
        for call in calls {
            self.populate_one(call, fabrics).await?;
        }
        info!(
            self.log,
            "populated fabric and cluster tables";
            "fabrics" => fabrics.len(),
            "clusters" => fabrics.iter().map(|f| f.clusters.len()).sum::<usize>(),
        );
        Ok(())
    }

    async fn populate_one(
        &self,
        call: &CallDescriptor,
        fabrics: &mut Vec<Fabric>,
    ) -> Result<(), PopulateError> {
        let topology_name = &call.cluster.topology;
        let topology =
            self.topology.cluster_topology(&call.cluster).await.map_err(
                |err| PopulateError::InvalidSwitchData {
                    cluster: topology_name.clone(),
                    err: Some(err),
                },
            )?;
        let switches = topology.qualified_switches();
        if switches.is_empty() {
            return Err(PopulateError::InvalidSwitchData {
                cluster: topology_name.clone(),
                err: None,
            });
        }
        let hash = fabric_hash(&switches);
        let log = self.log.new(o!(
            "cluster" => topology.cluster_name.clone(),
            "fabric_hash" => hash.clone(),
        ));

        let Some(index) =
            self.resolve_fabric(&log, &hash, &switches, fabrics).await?
        else {
            error!(log, "fabric could not be resolved; skipping cluster");
            return Ok(());
        };
        let fabric = &mut fabrics[index];
        self.refresh(fabric).await?;
        let fabric_id = fabric.id();
        let log = log.new(o!("fabric_id" => fabric_id.0));

        let name = topology.cluster_name.clone();
        if fabric.clusters.iter().any(|c| c.name == name) {
            debug!(log, "cluster already known to this run");
        } else {
            let row = match self.store.cluster_by_name(&name).await? {
                Some(row) => Some(row),
                None => {
                    info!(log, "registering cluster");
                    self.store.set_cluster_entry(&name, fabric_id).await?;
                    self.store.cluster_by_name(&name).await?
                }
            };
            let Some(row) = row else {
                error!(log, "cluster not found after registering; skipping");
                return Ok(());
            };
            if row.fabric_id != fabric_id {
                warn!(
                    log,
                    "cluster is attached to a different fabric; skipping";
                    "registered_fabric_id" => row.fabric_id.0,
                );
                return Ok(());
            }
            info!(log, "cluster added to fabric"; "cluster_id" => row.id.0);
            fabric.clusters.push(Cluster {
                id: row.id,
                name,
                fabric_id,
                call: call.clone(),
                switches: switches.clone(),
            });
        }

        let known = self.store.list_fabric_switches(fabric_id).await?;
        for switch in &switches {
            if !known.iter().any(|k| k.trim() == switch) {
                self.store.add_fabric_switch(fabric_id, switch).await?;
                info!(log, "switch added to fabric"; "switch" => switch);
            }
        }
        fabric.switches = switches;

        if call.targets_switch() && !fabric.row.do_switch {
            info!(log, "fabric has switch work pending");
            fabric.row.do_switch = true;
            self.store.set_fabric_do_switch(fabric_id, true).await?;
        }
        Ok(())
    }

    /// Finds or creates the fabric for `hash`, returning its index in
    /// `fabrics`.
    async fn resolve_fabric(
        &self,
        log: &Logger,
        hash: &str,
        switches: &[String],
        fabrics: &mut Vec<Fabric>,
    ) -> Result<Option<usize>, StoreError> {
        if let Some(index) = fabrics.iter().position(|f| f.row.hash == hash) {
            return Ok(Some(index));
        }

        let row = match self.store.fabric_by_hash(hash).await? {
            Some(row) => {
                debug!(log, "fabric already registered"; "fabric_id" => row.id.0);
                row
            }
            None => match self.store.fabric_for_switches(switches).await? {
                Some(id) => {
                    info!(
                        log,
                        "switch set changed; reattaching to existing fabric";
                        "fabric_id" => id.0,
                    );
                    match self.store.fabric_by_id(id).await? {
                        Some(row) => row,
                        None => return Ok(None),
                    }
                }
                None => {
                    info!(log, "registering new fabric");
                    match self.store.set_fabric_entry(hash).await? {
                        Some(row) => row,
                        None => return Ok(None),
                    }
                }
            },
        };

        // A reattached fabric may already be known under its old hash.
        if let Some(index) = fabrics.iter().position(|f| f.id() == row.id) {
            return Ok(Some(index));
        }
        fabrics.push(Fabric::new(row));
        Ok(Some(fabrics.len() - 1))
    }

    /// Re-reads a fabric's row and clears a stale switch-work flag.
    pub async fn refresh(&self, fabric: &mut Fabric) -> Result<(), StoreError> {
        let id = fabric.id();
        fabric.row = self
            .store
            .fabric_by_id(id)
            .await?
            .ok_or(StoreError::NoSuchFabric(id))?;
        if fabric.row.is_stale() {
            warn!(
                self.log,
                "clearing stale switch work flag";
                "fabric_id" => id.0,
                "lock_count" => fabric.row.lock.lock_count,
            );
            fabric.row.do_switch = false;
            self.store.set_fabric_do_switch(id, false).await?;
        }
        Ok(())
    }
}
