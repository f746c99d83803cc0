use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_admissible, now_ms, validate_range};
use super::{check_text_len, require_non_negative, require_text, Engine, EngineError};

fn validate_client(client: &Client) -> Result<(), EngineError> {
    require_text("client_name", &client.name)?;
    require_text("client_phone", &client.phone)?;
    if let Some(email) = &client.email {
        check_text_len("client_email", email)?;
    }
    Ok(())
}

/// Merge incoming payment metadata into what is already recorded. Objects
/// merge key by key; anything else replaces the old value.
fn merge_meta(current: &serde_json::Value, incoming: serde_json::Value) -> serde_json::Value {
    match (current, incoming) {
        (serde_json::Value::Object(old), serde_json::Value::Object(new)) => {
            let mut merged = old.clone();
            merged.extend(new);
            serde_json::Value::Object(merged)
        }
        (_, incoming) => incoming,
    }
}

/// Claim on an appointment id in the index, taken before the service lock.
/// Released on drop unless the booking was written.
struct IdReservation<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    committed: bool,
}

impl IdReservation<'_> {
    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.remove(&self.id);
        }
    }
}

impl Engine {
    fn reserve_appointment_id(
        &self,
        id: Ulid,
        service_id: Ulid,
    ) -> Result<IdReservation<'_>, EngineError> {
        match self.appointment_index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists("appointment", id)),
            Entry::Vacant(slot) => {
                slot.insert(service_id);
                Ok(IdReservation {
                    index: &self.appointment_index,
                    id,
                    committed: false,
                })
            }
        }
    }

    /// Admit a new appointment. Checks run in order: range, client fields,
    /// price, service existence and availability, then overlap.
    pub async fn create_appointment(
        &self,
        input: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let span = validate_range(input.start, input.end)?;
        validate_client(&input.client)?;
        if let Some(price) = input.total_price {
            require_non_negative("total_price", price)?;
        }

        let _gate = self.compaction_gate.read().await;
        let mut reservation = self.reserve_appointment_id(input.id, input.service_id)?;
        let ss = self
            .get_service(&input.service_id)
            .ok_or_else(|| EngineError::not_found("service", input.service_id))?;
        let mut guard = ss.write().await;
        if guard.deleted {
            return Err(EngineError::not_found("service", input.service_id));
        }
        if !guard.service.available {
            return Err(EngineError::Validation(format!(
                "service {} is not available for booking",
                input.service_id
            )));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many appointments on service"));
        }

        check_admissible(&guard, &span, None)?;

        let event = Event::AppointmentBooked {
            id: input.id,
            service_id: input.service_id,
            client: input.client,
            span,
            total_price: input.total_price.unwrap_or(guard.service.price),
            created_at: now_ms(),
        };
        self.persist_to_service(&mut guard, &event).await?;
        reservation.commit();
        tracing::info!(
            tenant = %self.slug,
            appointment_id = %input.id,
            service_id = %input.service_id,
            start = span.start,
            end = span.end,
            "appointment booked"
        );
        guard
            .appointment(input.id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", input.id))
    }

    /// Change details of an existing appointment, re-running admission with
    /// the appointment's own id excluded. Moving to another service locks
    /// both services in ascending id order.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.compaction_gate.read().await;
        // A new total_price on a paid appointment changes the balance.
        let _funds = self.funds.lock().await;

        let (current_sid, mut current) = self.resolve_appointment_write(id).await?;
        let target_sid = patch.service_id.unwrap_or(current_sid);

        let existing = current
            .appointment(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        if existing.status == AppointmentStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                entity: "appointment",
                from: existing.status.as_str(),
                to: "updated",
            });
        }

        let span = validate_range(
            patch.start.unwrap_or(existing.span.start),
            patch.end.unwrap_or(existing.span.end),
        )?;
        let client = Client {
            name: patch.client_name.unwrap_or(existing.client.name),
            phone: patch.client_phone.unwrap_or(existing.client.phone),
            email: patch.client_email.or(existing.client.email),
        };
        validate_client(&client)?;
        let total_price = patch.total_price.unwrap_or(existing.total_price);
        require_non_negative("total_price", total_price)?;

        let event = Event::AppointmentUpdated {
            id,
            from_service_id: current_sid,
            service_id: target_sid,
            client,
            span,
            total_price,
        };

        if target_sid == current_sid {
            check_admissible(&current, &span, Some(id))?;
            self.persist_to_service(&mut current, &event).await?;
            return current
                .appointment(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("appointment", id));
        }

        let target = self
            .get_service(&target_sid)
            .ok_or_else(|| EngineError::not_found("service", target_sid))?;
        // Ascending id order: release and reacquire when the target sorts first.
        let (mut src, mut dst) = if current_sid < target_sid {
            let dst = target.write_owned().await;
            (current, dst)
        } else {
            drop(current);
            let dst = target.write_owned().await;
            let (sid, src) = self.resolve_appointment_write(id).await?;
            if sid != current_sid {
                return Err(EngineError::Validation(format!(
                    "appointment {id} moved concurrently, retry the update"
                )));
            }
            (src, dst)
        };
        if dst.deleted {
            return Err(EngineError::not_found("service", target_sid));
        }
        if !dst.service.available {
            return Err(EngineError::Validation(format!(
                "service {target_sid} is not available for booking"
            )));
        }
        if dst.appointments.len() >= MAX_APPOINTMENTS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many appointments on service"));
        }
        check_admissible(&dst, &span, Some(id))?;

        self.persist_move(&mut src, &mut dst, &event).await?;
        tracing::info!(tenant = %self.slug, appointment_id = %id, from = %current_sid, to = %target_sid, "appointment moved");
        dst.appointment(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    pub async fn confirm_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.set_appointment_status(id, AppointmentStatus::Confirmed)
            .await
    }

    /// Cancelling frees the slot and removes the appointment from the balance.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.set_appointment_status(id, AppointmentStatus::Cancelled)
            .await
    }

    pub async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let _funds = match status {
            AppointmentStatus::Cancelled => Some(self.funds.lock().await),
            _ => None,
        };
        let (service_id, mut guard) = self.resolve_appointment_write(id).await?;
        let current = guard
            .appointment(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))?;

        if current.status == status {
            tracing::debug!(appointment_id = %id, status = status.as_str(), "status unchanged");
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                entity: "appointment",
                from: current.status.as_str(),
                to: status.as_str(),
            });
        }

        let event = Event::AppointmentStatusChanged {
            id,
            service_id,
            status,
        };
        self.persist_to_service(&mut guard, &event).await?;
        tracing::info!(tenant = %self.slug, appointment_id = %id, from = current.status.as_str(), to = status.as_str(), "appointment status changed");
        guard
            .appointment(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// Move the payment state along its transition table. Entering `paid`
    /// stamps `paid_at` and `paid_amount` (the given amount, else the price).
    pub async fn set_payment_status(
        &self,
        id: Ulid,
        update: PaymentUpdate,
    ) -> Result<Appointment, EngineError> {
        if let Some(amount) = update.amount {
            require_non_negative("paid_amount", amount)?;
        }
        if let Some(reference) = &update.reference {
            check_text_len("payment_id", reference)?;
        }
        if let Some(provider) = &update.provider {
            check_text_len("payment_provider", provider)?;
        }

        let _gate = self.compaction_gate.read().await;
        let _funds = self.funds.lock().await;
        let (service_id, mut guard) = self.resolve_appointment_write(id).await?;
        let current = guard
            .appointment(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let from = current.payment.status;

        if from == update.status {
            tracing::debug!(appointment_id = %id, status = from.as_str(), "payment status unchanged");
            return Ok(current);
        }
        if !from.can_transition_to(update.status) {
            return Err(EngineError::InvalidTransition {
                entity: "payment",
                from: from.as_str(),
                to: update.status.as_str(),
            });
        }

        let (paid_amount, paid_at) = if update.status == PaymentStatus::Paid {
            (
                Some(update.amount.unwrap_or(current.total_price)),
                Some(now_ms()),
            )
        } else {
            (current.payment.paid_amount, current.payment.paid_at)
        };
        let meta = match update.meta {
            Some(incoming) => merge_meta(&current.payment.meta, incoming),
            None => current.payment.meta.clone(),
        };
        let meta = meta_to_text(&meta);
        if meta.len() > MAX_META_BYTES {
            return Err(EngineError::LimitExceeded("payment_meta"));
        }

        let event = Event::PaymentStatusChanged {
            id,
            service_id,
            status: update.status,
            provider: update.provider.or(current.payment.provider),
            reference: update.reference.or(current.payment.reference),
            paid_amount,
            paid_at,
            meta,
        };
        self.persist_to_service(&mut guard, &event).await?;
        tracing::info!(
            tenant = %self.slug,
            appointment_id = %id,
            from = from.as_str(),
            to = update.status.as_str(),
            "payment status changed"
        );
        guard
            .appointment(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// Operator removal of an appointment row.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let _funds = self.funds.lock().await;
        let (service_id, mut guard) = self.resolve_appointment_write(id).await?;
        let event = Event::AppointmentDeleted { id, service_id };
        self.persist_to_service(&mut guard, &event).await?;
        tracing::info!(tenant = %self.slug, appointment_id = %id, "appointment deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::merge_meta;
    use serde_json::json;

    #[test]
    fn meta_objects_merge() {
        let merged = merge_meta(&json!({"a": 1, "b": 2}), json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn non_object_meta_replaces() {
        assert_eq!(merge_meta(&json!(null), json!({"x": true})), json!({"x": true}));
        assert_eq!(merge_meta(&json!({"x": true}), json!("note")), json!("note"));
    }
}
