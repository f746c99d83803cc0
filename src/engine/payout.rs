use serde_json::{json, Value};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::provider::{DispatchRequest, Dispatched, ProviderError};

use super::conflict::now_ms;
use super::{check_text_len, Engine, EngineError, PayoutBook};

/// Map a provider's status vocabulary onto payout states. Matching ignores
/// case and surrounding whitespace; anything unknown is rejected.
pub fn map_provider_status(raw: &str) -> Result<PayoutStatus, EngineError> {
    match raw.trim().to_lowercase().as_str() {
        "succeeded" | "paid" => Ok(PayoutStatus::Paid),
        "processing" => Ok(PayoutStatus::Processing),
        "pending" => Ok(PayoutStatus::Pending),
        "canceled" | "cancelled" | "failed" | "error" => Ok(PayoutStatus::Failed),
        _ => Err(EngineError::WebhookMapping(raw.to_string())),
    }
}

/// Provider payout id from a webhook body: the first of `payout_id`, `id`,
/// `provider_payout_id` that holds a non-empty string or a number.
pub fn webhook_payout_id(payload: &Value) -> Option<String> {
    ["payout_id", "id", "provider_payout_id"]
        .iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn set_meta(meta: &mut Value, key: &str, value: Value) {
    if !meta.is_object() {
        *meta = json!({});
    }
    if let Some(obj) = meta.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
}

/// `processed_at` is stamped on the first entry into a terminal state only.
fn stamp_processed(current: Option<Ms>, status: PayoutStatus) -> Option<Ms> {
    match current {
        Some(at) => Some(at),
        None if status.is_terminal() => Some(now_ms()),
        None => None,
    }
}

impl Engine {
    /// Balance read model, consistent with any payout decision taken after it.
    pub async fn compute_balance(&self) -> Balance {
        let book = self.funds.lock().await;
        self.balance_locked(&book).await
    }

    /// Caller holds the funds lock, so no appointment can enter or leave
    /// the paid set while the sum is taken.
    async fn balance_locked(&self, book: &PayoutBook) -> Balance {
        let mut paid_total = Money::ZERO;
        for (_, ss) in self.service_handles() {
            let guard = ss.read().await;
            if guard.deleted {
                continue;
            }
            paid_total += guard
                .appointments
                .iter()
                .filter(|a| a.counts_toward_balance())
                .map(|a| a.total_price)
                .sum::<Money>();
        }
        let (reserved, paid_out) = book.committed_totals();
        Balance::new(paid_total, reserved, paid_out)
    }

    /// Reserve funds for a withdrawal, then hand it to the configured
    /// provider. The balance check and the insert share one funds lock.
    pub async fn request_payout(&self, input: NewPayout) -> Result<PayoutRequest, EngineError> {
        if input.amount <= Money::ZERO {
            return Err(EngineError::Validation(format!(
                "payout amount must be positive, got {}",
                input.amount
            )));
        }
        if let Some(comment) = &input.comment
            && comment.len() > MAX_COMMENT_LEN
        {
            return Err(EngineError::LimitExceeded("payout comment"));
        }
        if let Some(requested_by) = &input.requested_by {
            check_text_len("requested_by", requested_by)?;
        }

        let id = Ulid::new();
        {
            let _gate = self.compaction_gate.read().await;
            let mut book = self.funds.lock().await;
            if book.len() >= MAX_PAYOUTS_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many payout requests"));
            }
            let balance = self.balance_locked(&book).await;
            if input.amount > balance.available {
                tracing::warn!(
                    tenant = %self.slug,
                    requested = %input.amount,
                    available = %balance.available,
                    "payout refused: insufficient balance"
                );
                return Err(EngineError::InsufficientBalance {
                    requested: input.amount,
                    available: balance.available,
                });
            }
            let currency = self.unit.read().await.currency.clone();
            let event = Event::PayoutRequested {
                id,
                amount: input.amount,
                currency,
                comment: input.comment,
                requested_by: input.requested_by,
                created_at: now_ms(),
            };
            self.persist_to_book(&mut book, &event).await?;
        }
        metrics::counter!(crate::observability::PAYOUTS_REQUESTED_TOTAL).increment(1);
        tracing::info!(tenant = %self.slug, payout_id = %id, amount = %input.amount, "payout requested");

        self.initiate_payout(id).await
    }

    /// Assign the tenant's provider and a provider payout id, then dispatch.
    /// The assignment is durable before the provider is called, so a webhook
    /// racing the dispatch response still finds the request. Dispatch errors
    /// never escape: the request stays pending with the error in its meta.
    pub async fn initiate_payout(&self, id: Ulid) -> Result<PayoutRequest, EngineError> {
        let settings = self.unit.read().await.payout.clone();
        let provider_name = match settings.provider.trim().to_lowercase() {
            p if p.is_empty() => DEFAULT_PROVIDER.to_string(),
            p => p,
        };

        let request = {
            let _gate = self.compaction_gate.read().await;
            let mut book = self.funds.lock().await;
            let current = book
                .get(&id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("payout", id))?;
            if current.status != PayoutStatus::Pending {
                return Err(EngineError::InvalidTransition {
                    entity: "payout",
                    from: current.status.as_str(),
                    to: "dispatched",
                });
            }
            // A retry with the same provider keeps its payout id.
            let provider_payout_id = match &current.provider_payout_id {
                Some(existing) if current.provider == provider_name => existing.clone(),
                _ => format!("{provider_name}-{}", Ulid::new()),
            };
            let event = Event::PayoutDispatched {
                id,
                provider: provider_name.clone(),
                provider_payout_id,
            };
            self.persist_to_book(&mut book, &event).await?;
            book.get(&id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("payout", id))?
        };

        let dispatch = DispatchRequest {
            payout_id: id,
            provider_payout_id: request.provider_payout_id.clone().unwrap_or_default(),
            amount: request.amount,
            currency: request.currency.clone(),
            method: settings.method,
            mode: settings.mode,
            account: settings.account.clone(),
            recipient: settings.recipient.clone(),
            extra: match meta_from_text(&settings.provider_extra) {
                Value::Null => json!({}),
                extra => extra,
            },
            provider_key: settings.provider_key.clone(),
            provider_secret: settings.provider_secret.clone(),
        };
        let outcome = match self.providers.get(&provider_name) {
            None => Err(ProviderError::Unknown(provider_name.clone())),
            Some(provider) => {
                match tokio::time::timeout(self.dispatch_timeout, provider.dispatch(&dispatch)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(self.dispatch_timeout)),
                }
            }
        };

        self.record_dispatch(id, &provider_name, outcome).await
    }

    async fn record_dispatch(
        &self,
        id: Ulid,
        provider: &str,
        outcome: Result<Dispatched, ProviderError>,
    ) -> Result<PayoutRequest, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut book = self.funds.lock().await;
        let current = book
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("payout", id))?;

        let mut meta = current.meta.clone();
        let (mut status, fee) = match outcome {
            Ok(dispatched) => {
                set_meta(&mut meta, "dispatch", dispatched.response);
                (dispatched.status, dispatched.fee)
            }
            Err(ProviderError::Timeout(after)) => {
                tracing::warn!(tenant = %self.slug, payout_id = %id, provider, ?after, "payout dispatch timed out, awaiting webhook");
                set_meta(
                    &mut meta,
                    "dispatch",
                    json!({ "error": "timeout", "after_ms": after.as_millis() as u64 }),
                );
                (PayoutStatus::Processing, current.fee)
            }
            Err(e) => {
                metrics::counter!(crate::observability::PAYOUT_DISPATCH_FAILURES_TOTAL, "provider" => provider.to_string())
                    .increment(1);
                tracing::warn!(tenant = %self.slug, payout_id = %id, provider, error = %e, "payout dispatch failed, left pending");
                set_meta(&mut meta, "dispatch", json!({ "error": e.to_string() }));
                (PayoutStatus::Pending, current.fee)
            }
        };
        // A webhook that arrived while we were dispatching is authoritative.
        if current.status != PayoutStatus::Pending {
            status = current.status;
        }
        let fee = if fee < Money::ZERO { Money::ZERO } else { fee };

        let event = Event::PayoutStatusChanged {
            id,
            status,
            fee,
            processed_at: stamp_processed(current.processed_at, status),
            meta: meta_to_text(&meta),
        };
        self.persist_to_book(&mut book, &event).await?;
        tracing::info!(tenant = %self.slug, payout_id = %id, provider, status = status.as_str(), "payout dispatched");
        book.get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("payout", id))
    }

    /// Apply a provider webhook. Safe under duplicate and out-of-order
    /// delivery: the mapped status is assigned, an exact replay writes
    /// nothing, and a terminal request ignores stale non-terminal reports.
    pub async fn reconcile_webhook(&self, payload: &Value) -> Result<PayoutRequest, EngineError> {
        if !payload.is_object() {
            return Err(EngineError::Validation(
                "webhook payload must be a JSON object".into(),
            ));
        }
        let provider_payout_id = webhook_payout_id(payload).ok_or_else(|| {
            EngineError::Validation("webhook payload has no payout_id, id or provider_payout_id".into())
        })?;
        let raw_status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("webhook payload has no status".into()))?;

        let _gate = self.compaction_gate.read().await;
        let mut book = self.funds.lock().await;
        let current = book
            .find_by_provider_id(&provider_payout_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("payout", &provider_payout_id))?;

        let mut meta = current.meta.clone();
        let next = match map_provider_status(raw_status) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(tenant = %self.slug, payout_id = %current.id, status = raw_status, "webhook rejected: unrecognized status");
                set_meta(&mut meta, "webhook_rejected", payload.clone());
                if meta != current.meta {
                    let event = Event::PayoutStatusChanged {
                        id: current.id,
                        status: current.status,
                        fee: current.fee,
                        processed_at: current.processed_at,
                        meta: meta_to_text(&meta),
                    };
                    self.persist_to_book(&mut book, &event).await?;
                }
                return Err(e);
            }
        };

        let status = if current.status.is_terminal() && !next.is_terminal() {
            tracing::debug!(payout_id = %current.id, current = current.status.as_str(), reported = next.as_str(), "stale webhook status ignored");
            current.status
        } else {
            next
        };
        set_meta(&mut meta, "webhook", payload.clone());

        if status == current.status && meta == current.meta {
            tracing::debug!(payout_id = %current.id, status = status.as_str(), "duplicate webhook, nothing to apply");
            return Ok(current);
        }

        let event = Event::PayoutStatusChanged {
            id: current.id,
            status,
            fee: current.fee,
            processed_at: stamp_processed(current.processed_at, status),
            meta: meta_to_text(&meta),
        };
        self.persist_to_book(&mut book, &event).await?;
        tracing::info!(
            tenant = %self.slug,
            payout_id = %current.id,
            provider_payout_id = %provider_payout_id,
            from = current.status.as_str(),
            to = status.as_str(),
            "payout reconciled"
        );
        book.get(&current.id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("payout", current.id))
    }

    pub async fn get_payout(&self, id: Ulid) -> Result<PayoutRequest, EngineError> {
        self.funds
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("payout", id))
    }

    /// All payout requests, newest first.
    pub async fn list_payouts(&self) -> Vec<PayoutRequest> {
        let book = self.funds.lock().await;
        let mut out: Vec<PayoutRequest> = book.iter().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }
}
