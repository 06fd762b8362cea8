use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::{apply_resource_event, Engine, EngineError};

fn validate_resource(resource: &Resource) -> Result<(), EngineError> {
    if resource.id.trim().is_empty() {
        return Err(EngineError::Validation("resource id must not be empty".into()));
    }
    if resource.id.len() > MAX_RESOURCE_ID_LEN {
        return Err(EngineError::LimitExceeded("resource id too long"));
    }
    if resource.zone.len() > MAX_ZONE_LEN {
        return Err(EngineError::LimitExceeded("zone label too long"));
    }
    if resource.capacity == 0 {
        return Err(EngineError::Validation(format!(
            "resource {} must have a positive capacity",
            resource.id
        )));
    }
    if resource.capacity > MAX_PARTY_SIZE {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

impl Engine {
    /// Provision a resource. Registration always starts active and clean.
    pub async fn register_resource(&self, resource: Resource) -> Result<ResourceId, EngineError> {
        validate_resource(&resource)?;
        let _registry = self.registry_lock.lock().await;
        let _commit = self.commit_lock.read().await;

        if self.resources.contains_key(&resource.id) {
            return Err(EngineError::DuplicateId(resource.id));
        }
        if self.resources.len() >= MAX_RESOURCES_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let Resource { id, kind, capacity, zone, .. } = resource;
        let event = Event::ResourceRegistered {
            id: id.clone(),
            kind,
            capacity,
            zone: zone.clone(),
        };
        self.wal_append(&event).await?;
        self.insert_resource(Resource::new(id.clone(), kind, capacity, zone));
        info!("registered {kind} {id} (capacity {capacity})");
        Ok(id)
    }

    pub async fn get_resource(&self, id: &str) -> Result<Resource, EngineError> {
        let rs = self
            .resource_state(id)
            .ok_or_else(|| EngineError::resource_not_found(id))?;
        let guard = rs.read().await;
        Ok(guard.resource.clone())
    }

    /// Snapshot of the registry ordered by id, optionally one kind only.
    pub async fn list_resources(&self, kind: Option<ResourceKind>) -> Vec<Resource> {
        let states: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for rs in states {
            let guard = rs.read().await;
            if kind.is_none_or(|k| guard.resource.kind == k) {
                out.push(guard.resource.clone());
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Soft retire. Existing reservations keep their allocations; new
    /// assignments are refused. Retiring twice is a no-op.
    pub async fn retire_resource(&self, id: &str) -> Result<Resource, EngineError> {
        let event = Event::ResourceRetired { id: id.to_string() };
        self.update_resource_flags(id, event, |r| r.retired).await
    }

    /// Housekeeping finished; clears `needs_cleaning`.
    pub async fn mark_clean(&self, id: &str) -> Result<Resource, EngineError> {
        let event = Event::ResourceCleaned { id: id.to_string() };
        self.update_resource_flags(id, event, |r| !r.needs_cleaning).await
    }

    async fn update_resource_flags(
        &self,
        id: &str,
        event: Event,
        already_applied: impl Fn(&Resource) -> bool,
    ) -> Result<Resource, EngineError> {
        let _commit = self.commit_lock.read().await;
        let rs = self
            .resource_state(id)
            .ok_or_else(|| EngineError::resource_not_found(id))?;
        let mut guard = rs.write().await;
        if already_applied(&guard.resource) {
            return Ok(guard.resource.clone());
        }
        self.wal_append(&event).await?;
        apply_resource_event(&mut guard.resource, &event);
        info!("resource {id}: {event:?}");
        Ok(guard.resource.clone())
    }
}
