//! Cluster topology snapshot.
//!
//! Loaded from the registry once at startup and read-only afterwards. All
//! mutable per-queue bookkeeping lives under the scheduler's single lock,
//! so the topology stays a plain immutable snapshot.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// One logical work queue bound to a topology node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub id: Uuid,
    pub name: String,
    pub machine_id: Option<Uuid>,
    /// Intake admission bound: at most this many jobs in flight at once.
    pub max_outstanding_jobs: usize,
    /// Default timeout for jobs without a per-job override.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: Uuid,
    pub name: String,
    pub host_name: String,
}

/// A database definition groups its instances by version name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDefinition {
    pub id: Uuid,
    pub name: String,
    pub instances_by_version: HashMap<String, Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInstance {
    pub id: Uuid,
    pub name: String,
    pub definition_id: Uuid,
    pub machine_id: Uuid,
    pub version: String,
}

/// Immutable-after-load snapshot of the cluster serving this scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub cluster_id: Uuid,
    pub cluster_name: String,
    pub queues: HashMap<Uuid, QueueDefinition>,
    pub machines: HashMap<Uuid, Machine>,
    /// Empty when the topology was loaded without the database layout.
    pub database_definitions: HashMap<Uuid, DatabaseDefinition>,
    pub database_instances: HashMap<Uuid, DatabaseInstance>,
}

impl ClusterTopology {
    pub fn queue(&self, queue_id: Uuid) -> Result<&QueueDefinition> {
        self.queues.get(&queue_id).ok_or_else(|| {
            SchedulerError::Topology(format!("unknown queue instance {queue_id}"))
        })
    }

    pub fn queue_ids(&self) -> Vec<Uuid> {
        self.queues.keys().copied().collect()
    }

    /// Register a database instance under its definition's version grouping.
    pub fn add_database_instance(&mut self, instance: DatabaseInstance) {
        if let Some(definition) = self.database_definitions.get_mut(&instance.definition_id) {
            definition
                .instances_by_version
                .entry(instance.version.clone())
                .or_default()
                .push(instance.id);
        }
        self.database_instances.insert(instance.id, instance);
    }
}
