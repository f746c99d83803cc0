use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, PayoutBook, WalControl};

fn appointment_events(appt: &Appointment, out: &mut Vec<Event>) {
    out.push(Event::AppointmentBooked {
        id: appt.id,
        service_id: appt.service_id,
        client: appt.client.clone(),
        span: appt.span,
        total_price: appt.total_price,
        created_at: appt.created_at,
    });
    if appt.status != AppointmentStatus::Pending {
        out.push(Event::AppointmentStatusChanged {
            id: appt.id,
            service_id: appt.service_id,
            status: appt.status,
        });
    }
    if appt.payment != Payment::default() {
        out.push(Event::PaymentStatusChanged {
            id: appt.id,
            service_id: appt.service_id,
            status: appt.payment.status,
            provider: appt.payment.provider.clone(),
            reference: appt.payment.reference.clone(),
            paid_amount: appt.payment.paid_amount,
            paid_at: appt.payment.paid_at,
            meta: meta_to_text(&appt.payment.meta),
        });
    }
}

fn payout_events(book: &PayoutBook, out: &mut Vec<Event>) {
    let mut requests: Vec<&PayoutRequest> = book.iter().collect();
    requests.sort_by_key(|r| r.id);
    for r in requests {
        out.push(Event::PayoutRequested {
            id: r.id,
            amount: r.amount,
            currency: r.currency.clone(),
            comment: r.comment.clone(),
            requested_by: r.requested_by.clone(),
            created_at: r.created_at,
        });
        if let Some(provider_payout_id) = &r.provider_payout_id {
            out.push(Event::PayoutDispatched {
                id: r.id,
                provider: r.provider.clone(),
                provider_payout_id: provider_payout_id.clone(),
            });
        }
        out.push(Event::PayoutStatusChanged {
            id: r.id,
            status: r.status,
            fee: r.fee,
            processed_at: r.processed_at,
            meta: meta_to_text(&r.meta),
        });
    }
}

impl Engine {
    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    /// Holds the compaction gate exclusively, so no mutation is between its
    /// WAL append and its in-memory apply while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let unit = self.unit.read().await.clone();
        let mut events = vec![Event::UnitRegistered {
            id: unit.id,
            slug: unit.slug.clone(),
            name: unit.name.clone(),
            currency: unit.currency.clone(),
            created_at: unit.created_at,
        }];
        if unit.payout != PayoutSettings::default() {
            events.push(Event::PayoutSettingsUpdated {
                settings: unit.payout.clone(),
            });
        }

        for (_, ss) in self.service_handles() {
            let guard = ss.read().await;
            if guard.deleted {
                continue;
            }
            let s = &guard.service;
            events.push(Event::ServiceCreated {
                id: s.id,
                title: s.title.clone(),
                category: s.category.clone(),
                price: s.price,
                available: s.available,
            });
            for appt in &guard.appointments {
                appointment_events(appt, &mut events);
            }
        }

        payout_events(&*self.funds.lock().await, &mut events);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_control(WalControl::Compact {
            events,
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;
        tracing::info!(tenant = %self.slug, events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_control(WalControl::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
