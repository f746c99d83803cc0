use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{check_text_len, require_non_negative, require_text, Engine, EngineError};

fn normalize_category(category: Option<String>) -> String {
    category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
}

impl Engine {
    pub async fn create_service(&self, input: NewService) -> Result<Service, EngineError> {
        require_text("title", &input.title)?;
        let category = normalize_category(input.category);
        check_text_len("category", &category)?;
        require_non_negative("price", input.price)?;

        let _gate = self.compaction_gate.read().await;
        if self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let service = Service {
            id: input.id,
            title: input.title.trim().to_string(),
            category,
            price: input.price,
            available: input.available,
        };
        let event = Event::ServiceCreated {
            id: service.id,
            title: service.title.clone(),
            category: service.category.clone(),
            price: service.price,
            available: service.available,
        };

        // Claim the id with the new state already write-locked, so nothing
        // reads it before the event is durable.
        let ss = Arc::new(RwLock::new(ServiceState::new(service.clone())));
        let mut guard = ss.clone().write_owned().await;
        match self.services.entry(service.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists("service", service.id)),
            Entry::Vacant(slot) => {
                slot.insert(ss);
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            guard.deleted = true;
            self.services.remove(&service.id);
            return Err(e);
        }
        drop(guard);
        tracing::info!(tenant = %self.slug, service_id = %service.id, title = %service.title, "service created");
        Ok(service)
    }

    pub async fn update_service(&self, id: Ulid, patch: ServicePatch) -> Result<Service, EngineError> {
        if let Some(title) = &patch.title {
            require_text("title", title)?;
        }
        if let Some(price) = patch.price {
            require_non_negative("price", price)?;
        }

        let _gate = self.compaction_gate.read().await;
        let ss = self
            .get_service(&id)
            .ok_or_else(|| EngineError::not_found("service", id))?;
        let mut guard = ss.write().await;
        if guard.deleted {
            return Err(EngineError::not_found("service", id));
        }

        let current = &guard.service;
        let title = patch
            .title
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| current.title.clone());
        let category = match patch.category {
            Some(c) => normalize_category(Some(c)),
            None => current.category.clone(),
        };
        check_text_len("category", &category)?;
        let price = patch.price.unwrap_or(current.price);
        let available = patch.available.unwrap_or(current.available);

        if title == current.title
            && category == current.category
            && price == current.price
            && available == current.available
        {
            return Ok(current.clone());
        }

        let event = Event::ServiceUpdated {
            id,
            title,
            category,
            price,
            available,
        };
        self.persist_to_service(&mut guard, &event).await?;
        Ok(guard.service.clone())
    }

    /// Remove a service and, with it, every appointment it owns. Returns the
    /// number of appointments removed.
    pub async fn delete_service(&self, id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.compaction_gate.read().await;
        // Paid appointments leave the balance with the service.
        let _funds = self.funds.lock().await;
        let ss = self
            .get_service(&id)
            .ok_or_else(|| EngineError::not_found("service", id))?;
        let mut guard = ss.write().await;
        if guard.deleted {
            return Err(EngineError::not_found("service", id));
        }

        self.wal_append(&Event::ServiceDeleted { id }).await?;
        guard.deleted = true;
        for appt in &guard.appointments {
            self.appointment_index.remove(&appt.id);
        }
        let removed = guard.appointments.len();
        self.services.remove(&id);
        tracing::info!(tenant = %self.slug, service_id = %id, appointments = removed, "service deleted");
        Ok(removed)
    }

    /// Services of this tenant, sorted by title.
    pub async fn services_of(&self, available_only: bool) -> Vec<Service> {
        let mut out = Vec::new();
        for (_, ss) in self.service_handles() {
            let guard = ss.read().await;
            if !guard.deleted && (!available_only || guard.service.available) {
                out.push(guard.service.clone());
            }
        }
        out.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn service_by_id(&self, id: Ulid) -> Result<Service, EngineError> {
        let ss = self
            .get_service(&id)
            .ok_or_else(|| EngineError::not_found("service", id))?;
        let guard = ss.read().await;
        if guard.deleted {
            return Err(EngineError::not_found("service", id));
        }
        Ok(guard.service.clone())
    }
}
