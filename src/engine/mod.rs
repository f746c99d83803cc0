mod catalog;
mod compact;
mod conflict;
mod error;
mod ledger;
mod payout;
mod queries;
mod unit;

pub use conflict::{find_conflict, is_admissible};
pub use error::EngineError;
pub use payout::{map_provider_status, webhook_payout_id};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::provider::ProviderRegistry;
use crate::wal::Wal;

use conflict::now_ms;

pub type SharedServiceState = Arc<RwLock<ServiceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(WalControl),
}

pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends for group commit: every append already
/// queued when the first one is picked up shares a single fsync. A control
/// command ends the batch window and runs after the batch is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut control = match cmd {
            WalCommand::Append { event, response } => {
                batch.push((event, response));
                None
            }
            WalCommand::Control(c) => Some(c),
        };
        while control.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(WalCommand::Control(c)) => control = Some(c),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(c) = control {
            handle_control(&mut wal, c);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-buffered bytes don't ride
    // along with the next batch; every caller in this batch sees the error.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Payout book ──────────────────────────────────────────

/// A tenant's payout requests, indexed by provider payout id for webhooks.
#[derive(Debug, Default)]
pub struct PayoutBook {
    requests: HashMap<Ulid, PayoutRequest>,
    by_provider_id: HashMap<String, Ulid>,
}

impl PayoutBook {
    pub fn get(&self, id: &Ulid) -> Option<&PayoutRequest> {
        self.requests.get(id)
    }

    pub fn find_by_provider_id(&self, provider_payout_id: &str) -> Option<&PayoutRequest> {
        self.by_provider_id
            .get(provider_payout_id)
            .and_then(|id| self.requests.get(id))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PayoutRequest> {
        self.requests.values()
    }

    /// `(reserved, paid_out)` over all requests.
    pub fn committed_totals(&self) -> (Money, Money) {
        self.requests
            .values()
            .fold((Money::ZERO, Money::ZERO), |(reserved, paid_out), r| {
                if r.status.is_reserved() {
                    (reserved + r.amount, paid_out)
                } else if r.status == PayoutStatus::Paid {
                    (reserved, paid_out + r.amount)
                } else {
                    (reserved, paid_out)
                }
            })
    }
}

// ── Event application (no locking — caller holds the lock) ──

fn apply_to_unit(unit: &mut BusinessUnit, event: &Event) {
    match event {
        Event::UnitRegistered {
            id,
            slug,
            name,
            currency,
            created_at,
        } => {
            unit.id = *id;
            unit.slug = slug.clone();
            unit.name = name.clone();
            unit.currency = currency.clone();
            unit.created_at = *created_at;
        }
        Event::UnitUpdated { name, currency } => {
            unit.name = name.clone();
            unit.currency = currency.clone();
        }
        Event::PayoutSettingsUpdated { settings } => unit.payout = settings.clone(),
        _ => {}
    }
}

fn apply_to_service(ss: &mut ServiceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ServiceUpdated {
            title,
            category,
            price,
            available,
            ..
        } => {
            ss.service.title = title.clone();
            ss.service.category = category.clone();
            ss.service.price = *price;
            ss.service.available = *available;
        }
        Event::AppointmentBooked {
            id,
            service_id,
            client,
            span,
            total_price,
            created_at,
        } => {
            ss.insert_appointment(Appointment {
                id: *id,
                service_id: *service_id,
                client: client.clone(),
                span: *span,
                total_price: *total_price,
                status: AppointmentStatus::Pending,
                payment: Payment::default(),
                created_at: *created_at,
            });
            index.insert(*id, *service_id);
        }
        // Same-service update only; moves go through `apply_move`.
        Event::AppointmentUpdated {
            id,
            client,
            span,
            total_price,
            ..
        } => {
            if let Some(mut appt) = ss.remove_appointment(*id) {
                appt.client = client.clone();
                appt.span = *span;
                appt.total_price = *total_price;
                ss.insert_appointment(appt);
            }
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(appt) = ss.appointment_mut(*id) {
                appt.status = *status;
            }
        }
        Event::PaymentStatusChanged {
            id,
            status,
            provider,
            reference,
            paid_amount,
            paid_at,
            meta,
            ..
        } => {
            if let Some(appt) = ss.appointment_mut(*id) {
                appt.payment = Payment {
                    status: *status,
                    provider: provider.clone(),
                    reference: reference.clone(),
                    paid_amount: *paid_amount,
                    paid_at: *paid_at,
                    meta: meta_from_text(meta),
                };
            }
        }
        Event::AppointmentDeleted { id, .. } => {
            ss.remove_appointment(*id);
            index.remove(id);
        }
        _ => {}
    }
}

/// Apply an `AppointmentUpdated` that changes the service.
fn apply_move(
    src: &mut ServiceState,
    dst: &mut ServiceState,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) {
    let Event::AppointmentUpdated {
        id,
        service_id,
        client,
        span,
        total_price,
        ..
    } = event
    else {
        return;
    };
    if let Some(mut appt) = src.remove_appointment(*id) {
        appt.service_id = *service_id;
        appt.client = client.clone();
        appt.span = *span;
        appt.total_price = *total_price;
        dst.insert_appointment(appt);
        index.insert(*id, *service_id);
    }
}

fn apply_to_book(book: &mut PayoutBook, event: &Event) {
    match event {
        Event::PayoutRequested {
            id,
            amount,
            currency,
            comment,
            requested_by,
            created_at,
        } => {
            book.requests.insert(
                *id,
                PayoutRequest {
                    id: *id,
                    amount: *amount,
                    fee: Money::ZERO,
                    currency: currency.clone(),
                    status: PayoutStatus::Pending,
                    provider: DEFAULT_PROVIDER.to_string(),
                    provider_payout_id: None,
                    meta: serde_json::Value::Null,
                    comment: comment.clone(),
                    requested_by: requested_by.clone(),
                    created_at: *created_at,
                    processed_at: None,
                },
            );
        }
        Event::PayoutDispatched {
            id,
            provider,
            provider_payout_id,
        } => {
            if let Some(request) = book.requests.get_mut(id) {
                if let Some(previous) = request.provider_payout_id.take() {
                    book.by_provider_id.remove(&previous);
                }
                request.provider = provider.clone();
                request.provider_payout_id = Some(provider_payout_id.clone());
                book.by_provider_id.insert(provider_payout_id.clone(), *id);
            }
        }
        Event::PayoutStatusChanged {
            id,
            status,
            fee,
            processed_at,
            meta,
        } => {
            if let Some(request) = book.requests.get_mut(id) {
                request.status = *status;
                request.fee = *fee;
                request.processed_at = *processed_at;
                request.meta = meta_from_text(meta);
            }
        }
        _ => {}
    }
}

/// Service an event belongs to, for events applied to a single service.
fn event_service_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ServiceUpdated { id, .. } => Some(*id),
        Event::AppointmentBooked { service_id, .. }
        | Event::AppointmentUpdated { service_id, .. }
        | Event::AppointmentStatusChanged { service_id, .. }
        | Event::PaymentStatusChanged { service_id, .. }
        | Event::AppointmentDeleted { service_id, .. } => Some(*service_id),
        _ => None,
    }
}

// ── Engine ───────────────────────────────────────────────

/// One tenant's booking and settlement state.
///
/// Lock order: `compaction_gate` (shared), then `funds`, then service locks
/// in ascending id order.
pub struct Engine {
    slug: String,
    unit: RwLock<BusinessUnit>,
    services: DashMap<Ulid, SharedServiceState>,
    /// Reverse lookup: appointment id → service id
    appointment_index: DashMap<Ulid, Ulid>,
    /// Payout requests; the mutex also serializes every change to paid totals
    /// that a concurrent balance check could observe.
    funds: Mutex<PayoutBook>,
    /// Mutations hold it shared from WAL append to apply; compaction takes it
    /// exclusively so the snapshot cannot miss an appended event.
    compaction_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    providers: Arc<ProviderRegistry>,
    dispatch_timeout: Duration,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        slug: &str,
        providers: Arc<ProviderRegistry>,
        dispatch_timeout: Duration,
    ) -> io::Result<Self> {
        let mut events = Wal::replay(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;

        if !events
            .iter()
            .any(|e| matches!(e, Event::UnitRegistered { .. }))
        {
            let unit_id = Ulid::new();
            let registered = Event::UnitRegistered {
                id: unit_id,
                slug: slug.to_string(),
                name: slug.to_string(),
                currency: DEFAULT_CURRENCY.to_string(),
                created_at: now_ms(),
            };
            wal.append(&registered)?;
            tracing::info!(tenant = slug, %unit_id, "registered business unit");
            events.insert(0, registered);
        }

        let mut unit = BusinessUnit {
            id: Ulid::nil(),
            slug: slug.to_string(),
            name: slug.to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
            payout: PayoutSettings::default(),
            created_at: 0,
        };
        let mut services: HashMap<Ulid, ServiceState> = HashMap::new();
        let appointment_index = DashMap::new();
        let mut book = PayoutBook::default();

        // Replay into plain maps; nothing is shared yet, so no locks.
        for event in &events {
            match event {
                Event::UnitRegistered { .. }
                | Event::UnitUpdated { .. }
                | Event::PayoutSettingsUpdated { .. } => apply_to_unit(&mut unit, event),
                Event::ServiceCreated {
                    id,
                    title,
                    category,
                    price,
                    available,
                } => {
                    services.insert(
                        *id,
                        ServiceState::new(Service {
                            id: *id,
                            title: title.clone(),
                            category: category.clone(),
                            price: *price,
                            available: *available,
                        }),
                    );
                }
                Event::ServiceDeleted { id } => {
                    if let Some(ss) = services.remove(id) {
                        for appt in &ss.appointments {
                            appointment_index.remove(&appt.id);
                        }
                    }
                }
                Event::AppointmentUpdated {
                    from_service_id,
                    service_id,
                    ..
                } if from_service_id != service_id => {
                    if let Some(mut src) = services.remove(from_service_id) {
                        if let Some(dst) = services.get_mut(service_id) {
                            apply_move(&mut src, dst, event, &appointment_index);
                        }
                        services.insert(*from_service_id, src);
                    }
                }
                Event::PayoutRequested { .. }
                | Event::PayoutDispatched { .. }
                | Event::PayoutStatusChanged { .. } => apply_to_book(&mut book, event),
                other => {
                    if let Some(sid) = event_service_id(other)
                        && let Some(ss) = services.get_mut(&sid)
                    {
                        apply_to_service(ss, other, &appointment_index);
                    }
                }
            }
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        tracing::debug!(
            tenant = slug,
            events = events.len(),
            services = services.len(),
            payouts = book.len(),
            "replayed tenant WAL"
        );

        Ok(Self {
            slug: slug.to_string(),
            unit: RwLock::new(unit),
            services: services
                .into_iter()
                .map(|(id, ss)| (id, Arc::new(RwLock::new(ss))))
                .collect(),
            appointment_index,
            funds: Mutex::new(book),
            compaction_gate: RwLock::new(()),
            wal_tx,
            providers,
            dispatch_timeout,
        })
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    async fn wal_control(&self, control: WalControl) -> Result<(), EngineError> {
        self.wal_tx
            .send(WalCommand::Control(control))
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))
    }

    pub(super) async fn persist_to_unit(
        &self,
        unit: &mut BusinessUnit,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_unit(unit, event);
        Ok(())
    }

    pub(super) async fn persist_to_service(
        &self,
        ss: &mut ServiceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_service(ss, event, &self.appointment_index);
        Ok(())
    }

    pub(super) async fn persist_move(
        &self,
        src: &mut ServiceState,
        dst: &mut ServiceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_move(src, dst, event, &self.appointment_index);
        Ok(())
    }

    pub(super) async fn persist_to_book(
        &self,
        book: &mut PayoutBook,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_book(book, event);
        Ok(())
    }

    pub fn get_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn service_of_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_index.get(appointment_id).map(|e| *e.value())
    }

    /// Snapshot of all service handles in ascending id order. The DashMap
    /// guard is released before any of them is awaited.
    fn service_handles(&self) -> Vec<(Ulid, SharedServiceState)> {
        let mut handles: Vec<_> = self
            .services
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    /// Lookup appointment → service, acquire its write lock. Retries when the
    /// appointment moved to another service between lookup and lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ServiceState>), EngineError> {
        for _ in 0..3 {
            let Some(service_id) = self.service_of_appointment(&appointment_id) else {
                break;
            };
            let Some(ss) = self.get_service(&service_id) else {
                break;
            };
            let guard = ss.write_owned().await;
            if !guard.deleted && guard.appointment(appointment_id).is_some() {
                return Ok((service_id, guard));
            }
        }
        Err(EngineError::not_found("appointment", appointment_id))
    }
}

/// Non-empty and within `MAX_TEXT_LEN`.
pub(super) fn require_text(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    check_text_len(field, value)
}

pub(super) fn check_text_len(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.len() > crate::limits::MAX_TEXT_LEN {
        tracing::warn!(field, len = value.len(), "text field over limit");
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

pub(super) fn require_non_negative(field: &'static str, amount: Money) -> Result<(), EngineError> {
    if amount < Money::ZERO {
        return Err(EngineError::Validation(format!(
            "{field} must be non-negative, got {amount}"
        )));
    }
    Ok(())
}
