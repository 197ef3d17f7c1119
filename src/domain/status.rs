use std::collections::HashMap;
use std::sync::RwLock;

use log::warn;

use super::model::DeploymentStatus;

/// Owned, process-lifetime status map. Terminal records are sticky: once a
/// deployment is COMPLETED or FAILED no later write can move it.
#[derive(Default)]
pub struct StatusStore {
    records: RwLock<HashMap<String, DeploymentStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, deployment_id: &str, status: DeploymentStatus) {
        let mut records = self.records.write().expect("status store poisoned");
        if let Some(current) = records.get(deployment_id) {
            if current.is_terminal() {
                warn!(
                    "Refusing status transition {} -> {} for deployment {}",
                    current.label(),
                    status.label(),
                    deployment_id
                );
                return;
            }
        }
        records.insert(deployment_id.to_string(), status);
    }

    pub fn get(&self, deployment_id: &str) -> Option<DeploymentStatus> {
        self.records
            .read()
            .expect("status store poisoned")
            .get(deployment_id)
            .cloned()
    }
}
