//! Payout providers: the only place a withdrawal leaves the engine.
//!
//! A provider answers a dispatch with an initial status. Terminal states for
//! networked providers arrive later through the webhook path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use ulid::Ulid;

use crate::model::{Money, PayoutMethod, PayoutMode, PayoutRecipient, PayoutStatus};

#[derive(Clone)]
pub struct DispatchRequest {
    pub payout_id: Ulid,
    pub provider_payout_id: String,
    pub amount: Money,
    pub currency: String,
    pub method: PayoutMethod,
    pub mode: PayoutMode,
    pub account: String,
    pub recipient: PayoutRecipient,
    /// Tenant-configured provider options, an empty object when unset.
    pub extra: serde_json::Value,
    pub provider_key: String,
    pub provider_secret: String,
}

impl fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("payout_id", &self.payout_id)
            .field("provider_payout_id", &self.provider_payout_id)
            .field("amount", &self.amount)
            .field("currency", &self.currency)
            .field("method", &self.method)
            .field("mode", &self.mode)
            .field("account", &self.account)
            .field("recipient", &self.recipient)
            .field("extra", &self.extra)
            .field("provider_key", &self.provider_key)
            .field("provider_secret", &"[redacted]")
            .finish()
    }
}

/// What a provider said when it accepted a payout.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub status: PayoutStatus,
    pub fee: Money,
    /// Recorded verbatim in the payout's metadata.
    pub response: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown payout provider: {0}")]
    Unknown(String),
    #[error("provider rejected payout: {0}")]
    Rejected(String),
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait PayoutProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch(&self, request: &DispatchRequest) -> Result<Dispatched, ProviderError>;
}

/// An operator moves the money by hand; the request waits in `pending`.
pub struct ManualProvider;

#[async_trait]
impl PayoutProvider for ManualProvider {
    fn name(&self) -> &str {
        "manual"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<Dispatched, ProviderError> {
        Ok(Dispatched {
            status: PayoutStatus::Pending,
            fee: Money::ZERO,
            response: json!({
                "provider": self.name(),
                "payout_id": request.provider_payout_id,
                "note": "awaiting manual transfer",
            }),
        })
    }
}

/// Settles instantly. Used for `mock` and `test` setups.
pub struct SyntheticProvider {
    name: String,
}

impl SyntheticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl PayoutProvider for SyntheticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<Dispatched, ProviderError> {
        Ok(Dispatched {
            status: PayoutStatus::Paid,
            fee: Money::ZERO,
            response: json!({
                "provider": self.name,
                "payout_id": request.provider_payout_id,
                "synthetic": true,
            }),
        })
    }
}

/// A real payment network. Acceptance moves the payout to `processing`;
/// the provider's webhook decides the outcome.
pub struct NetworkProvider {
    name: String,
}

impl NetworkProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl PayoutProvider for NetworkProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<Dispatched, ProviderError> {
        if request.mode == PayoutMode::Live
            && (request.provider_key.is_empty() || request.provider_secret.is_empty())
        {
            return Err(ProviderError::Rejected(format!(
                "{} live mode requires provider credentials",
                self.name
            )));
        }
        if request.account.trim().is_empty() {
            return Err(ProviderError::Rejected("no payout account configured".into()));
        }
        if request.mode == PayoutMode::Live
            && request.method == PayoutMethod::Bank
            && (request.recipient.name.is_empty() || request.recipient.bik.is_empty())
        {
            return Err(ProviderError::Rejected(
                "bank transfer needs recipient name and BIK".into(),
            ));
        }
        tracing::debug!(provider = %self.name, payout_id = %request.provider_payout_id, amount = %request.amount, "payout accepted by provider");
        Ok(Dispatched {
            status: PayoutStatus::Processing,
            fee: Money::ZERO,
            response: json!({
                "provider": self.name,
                "payout_id": request.provider_payout_id,
                "mode": request.mode.as_str(),
                "method": request.method.as_str(),
                "recipient": request.recipient.name,
                "options": request.extra,
                "accepted": true,
            }),
        })
    }
}

/// Provider identifier → implementation.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PayoutProvider>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// `manual`, `mock`, `test`, `yookassa`, `cloudpayments`, `tinkoff`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ManualProvider));
        registry.register(Arc::new(SyntheticProvider::new("mock")));
        registry.register(Arc::new(SyntheticProvider::new("test")));
        for name in ["yookassa", "cloudpayments", "tinkoff"] {
            registry.register(Arc::new(NetworkProvider::new(name)));
        }
        registry
    }

    /// Registers under `provider.name()`, replacing any previous entry.
    pub fn register(&mut self, provider: Arc<dyn PayoutProvider>) {
        self.providers
            .insert(provider.name().to_lowercase(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PayoutProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(mode: PayoutMode, account: &str) -> DispatchRequest {
        DispatchRequest {
            payout_id: Ulid::new(),
            provider_payout_id: "x-1".into(),
            amount: dec!(1000),
            currency: "RUB".into(),
            method: PayoutMethod::Bank,
            mode,
            account: account.into(),
            recipient: PayoutRecipient::default(),
            extra: json!({}),
            provider_key: String::new(),
            provider_secret: "shh".into(),
        }
    }

    #[tokio::test]
    async fn initial_status_by_provider_class() {
        let registry = ProviderRegistry::with_defaults();
        let req = request(PayoutMode::Test, "40817810000000000001");
        let expect = [
            ("manual", PayoutStatus::Pending),
            ("mock", PayoutStatus::Paid),
            ("test", PayoutStatus::Paid),
            ("yookassa", PayoutStatus::Processing),
            ("cloudpayments", PayoutStatus::Processing),
            ("tinkoff", PayoutStatus::Processing),
        ];
        for (name, status) in expect {
            let provider = registry.get(name).unwrap();
            assert_eq!(provider.dispatch(&req).await.unwrap().status, status, "{name}");
        }
        assert!(registry.get("paypal").is_none());
    }

    #[tokio::test]
    async fn live_network_payout_needs_credentials() {
        let provider = NetworkProvider::new("yookassa");
        let err = provider
            .dispatch(&request(PayoutMode::Live, "40817810000000000001"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }

    #[tokio::test]
    async fn live_bank_payout_needs_recipient_details() {
        let provider = NetworkProvider::new("yookassa");
        let mut req = DispatchRequest {
            provider_key: "shop-1".into(),
            extra: json!({ "agent_id": 42 }),
            ..request(PayoutMode::Live, "40817810000000000001")
        };
        assert!(matches!(
            provider.dispatch(&req).await,
            Err(ProviderError::Rejected(_))
        ));

        req.recipient = PayoutRecipient {
            name: "OOO Sunrise".into(),
            bik: "044525225".into(),
            ..PayoutRecipient::default()
        };
        let accepted = provider.dispatch(&req).await.unwrap();
        assert_eq!(accepted.status, PayoutStatus::Processing);
        assert_eq!(accepted.response["recipient"], json!("OOO Sunrise"));
        assert_eq!(accepted.response["options"]["agent_id"], json!(42));

        // SBP goes by phone and needs no bank details
        req.method = PayoutMethod::Sbp;
        req.recipient = PayoutRecipient::default();
        assert!(provider.dispatch(&req).await.is_ok());
    }

    #[tokio::test]
    async fn network_payout_needs_account() {
        let provider = NetworkProvider::new("tinkoff");
        assert!(provider.dispatch(&request(PayoutMode::Test, " ")).await.is_err());
    }

    #[test]
    fn dispatch_request_debug_hides_secret() {
        let shown = format!("{:?}", request(PayoutMode::Test, "acc"));
        assert!(!shown.contains("shh"));
    }
}
