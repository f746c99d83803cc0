use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Money amounts. Always decimal, never floating point.
pub type Money = Decimal;

pub const DEFAULT_CURRENCY: &str = "RUB";
pub const DEFAULT_PROVIDER: &str = "manual";
pub const DEFAULT_CATEGORY: &str = "standard";

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict comparison on both sides, so `[a, b)` and `[b, c)` do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Status machines ──────────────────────────────────────────────

/// Lifecycle of an appointment. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(AppointmentStatus::Pending),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        matches!(
            (self, next),
            (AppointmentStatus::Pending, AppointmentStatus::Confirmed)
                | (AppointmentStatus::Pending, AppointmentStatus::Cancelled)
                | (AppointmentStatus::Confirmed, AppointmentStatus::Cancelled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment state of an appointment. Only `Paid` counts toward the payout balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    /// `failed -> pending` lets a failed charge be retried; everything else
    /// outside the table is refused.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Paid)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Paid, PaymentStatus::Refunded)
                | (PaymentStatus::Failed, PaymentStatus::Pending)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PayoutStatus {
    #[default]
    Pending,
    Processing,
    Paid,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Paid | PayoutStatus::Failed)
    }

    /// Pending and processing requests hold funds back from the balance.
    pub fn is_reserved(&self) -> bool {
        matches!(self, PayoutStatus::Pending | PayoutStatus::Processing)
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PayoutMethod {
    #[default]
    Bank,
    Sbp,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::Bank => "bank",
            PayoutMethod::Sbp => "sbp",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bank" => Some(PayoutMethod::Bank),
            "sbp" => Some(PayoutMethod::Sbp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PayoutMode {
    #[default]
    Test,
    Live,
}

impl PayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMode::Test => "test",
            PayoutMode::Live => "live",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "test" => Some(PayoutMode::Test),
            "live" => Some(PayoutMode::Live),
            _ => None,
        }
    }
}

// ── Tenant ───────────────────────────────────────────────────────

/// Where and how a tenant's withdrawals are sent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSettings {
    pub method: PayoutMethod,
    pub provider: String,
    pub mode: PayoutMode,
    pub provider_key: String,
    pub provider_secret: String,
    pub webhook_secret: String,
    /// Settlement account or card number.
    pub account: String,
    pub recipient: PayoutRecipient,
    /// Provider-specific options as JSON object text; empty when unset.
    pub provider_extra: String,
}

/// Legal details of whoever receives the tenant's payouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRecipient {
    /// Legal name or full name.
    pub name: String,
    pub bank: String,
    pub bik: String,
    pub inn: String,
    pub kpp: String,
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            method: PayoutMethod::Bank,
            provider: DEFAULT_PROVIDER.to_string(),
            mode: PayoutMode::Test,
            provider_key: String::new(),
            provider_secret: String::new(),
            webhook_secret: String::new(),
            account: String::new(),
            recipient: PayoutRecipient::default(),
            provider_extra: String::new(),
        }
    }
}

impl fmt::Debug for PayoutSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayoutSettings")
            .field("method", &self.method)
            .field("provider", &self.provider)
            .field("mode", &self.mode)
            .field("provider_key", &self.provider_key)
            .field("provider_secret", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("account", &self.account)
            .field("recipient", &self.recipient)
            .field("provider_extra", &self.provider_extra)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessUnit {
    pub id: Ulid,
    pub slug: String,
    pub name: String,
    pub currency: String,
    pub payout: PayoutSettings,
    pub created_at: Ms,
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: Ulid,
    pub title: String,
    pub category: String,
    pub price: Money,
    pub available: bool,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payment {
    pub status: PaymentStatus,
    pub provider: Option<String>,
    pub reference: Option<String>,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<Ms>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Appointment {
    pub id: Ulid,
    pub service_id: Ulid,
    pub client: Client,
    pub span: Span,
    pub total_price: Money,
    pub status: AppointmentStatus,
    pub payment: Payment,
    pub created_at: Ms,
}

impl Appointment {
    /// Occupies its slot for conflict purposes.
    pub fn is_active(&self) -> bool {
        self.status != AppointmentStatus::Cancelled
    }

    /// Contributes `total_price` to the tenant's payout balance.
    pub fn counts_toward_balance(&self) -> bool {
        self.is_active() && self.payment.status == PaymentStatus::Paid
    }
}

/// A service together with all of its appointments, guarded as one unit so
/// that the overlap check and the write that follows it cannot interleave.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub service: Service,
    /// All appointments (cancelled included), sorted by `span.start`.
    pub appointments: Vec<Appointment>,
    /// Set under the write lock right before the service leaves the catalog.
    pub deleted: bool,
}

impl ServiceState {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            appointments: Vec::new(),
            deleted: false,
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps the query window, cancelled ones included.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

// ── Payouts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub id: Ulid,
    pub amount: Money,
    pub fee: Money,
    pub currency: String,
    pub status: PayoutStatus,
    pub provider: String,
    pub provider_payout_id: Option<String>,
    pub meta: serde_json::Value,
    pub comment: Option<String>,
    pub requested_by: Option<String>,
    pub created_at: Ms,
    /// Set once, on the first move into `paid` or `failed`.
    pub processed_at: Option<Ms>,
}

impl PayoutRequest {
    /// Money actually disbursed to the tenant.
    pub fn amount_after_fee(&self) -> Money {
        self.amount - self.fee
    }
}

/// Funds read model shown on the tenant's settings surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub paid_total: Money,
    pub reserved: Money,
    pub paid_out: Money,
    /// Reported as computed; may be negative after a refund.
    pub available: Money,
}

impl Balance {
    pub fn new(paid_total: Money, reserved: Money, paid_out: Money) -> Self {
        Self {
            paid_total,
            reserved,
            paid_out,
            available: paid_total - reserved - paid_out,
        }
    }
}

/// Dashboard figures for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub total_appointments: usize,
    pub active_appointments: usize,
    pub confirmed_revenue: Money,
    pub services: usize,
    /// Active appointments per service, capped at 100, one decimal place.
    pub occupancy_rate: Money,
    /// Confirmed revenue by creation month, the last six months oldest first.
    pub revenue_by_month: Vec<MonthlyRevenue>,
    /// Confirmed appointments by start weekday (UTC), Monday first.
    pub weekday_bookings: [usize; 7],
    /// Up to five services by confirmed bookings, then revenue.
    pub top_services: Vec<ServiceStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyRevenue {
    /// `YYYY-MM`
    pub month: String,
    pub revenue: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub service_id: Ulid,
    pub title: String,
    pub bookings: usize,
    pub revenue: Money,
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewService {
    pub id: Ulid,
    pub title: String,
    pub category: Option<String>,
    pub price: Money,
    pub available: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub title: Option<String>,
    pub category: Option<String>,
    pub price: Option<Money>,
    pub available: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub service_id: Ulid,
    pub client: Client,
    pub start: Ms,
    pub end: Ms,
    /// Falls back to the service price when absent.
    pub total_price: Option<Money>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub service_id: Option<Ulid>,
    pub client_name: Option<String>,
    pub client_phone: Option<String>,
    pub client_email: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub total_price: Option<Money>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub amount: Option<Money>,
    pub reference: Option<String>,
    pub provider: Option<String>,
    pub meta: Option<serde_json::Value>,
}

impl PaymentUpdate {
    pub fn to(status: PaymentStatus) -> Self {
        Self {
            status,
            amount: None,
            reference: None,
            provider: None,
            meta: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub service_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
    pub starts_from: Option<Ms>,
    pub ends_before: Option<Ms>,
}

impl AppointmentFilter {
    pub fn matches(&self, a: &Appointment) -> bool {
        self.service_id.is_none_or(|sid| a.service_id == sid)
            && self.status.is_none_or(|s| a.status == s)
            && self.starts_from.is_none_or(|t| a.span.start >= t)
            && self.ends_before.is_none_or(|t| a.span.end <= t)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayout {
    pub amount: Money,
    pub comment: Option<String>,
    pub requested_by: Option<String>,
}

/// Partial update of a tenant's profile and payout settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitChanges {
    pub name: Option<String>,
    pub currency: Option<String>,
    pub payout_method: Option<PayoutMethod>,
    pub payout_provider: Option<String>,
    pub payout_mode: Option<PayoutMode>,
    pub provider_key: Option<String>,
    pub provider_secret: Option<String>,
    pub webhook_secret: Option<String>,
    pub account: Option<String>,
    pub recipient_name: Option<String>,
    pub bank: Option<String>,
    pub bik: Option<String>,
    pub inn: Option<String>,
    pub kpp: Option<String>,
    pub provider_extra: Option<String>,
}

impl UnitChanges {
    pub fn touches_profile(&self) -> bool {
        self.name.is_some() || self.currency.is_some()
    }

    pub fn touches_payout(&self) -> bool {
        self.payout_method.is_some()
            || self.payout_provider.is_some()
            || self.payout_mode.is_some()
            || self.provider_key.is_some()
            || self.provider_secret.is_some()
            || self.webhook_secret.is_some()
            || self.account.is_some()
            || self.recipient_name.is_some()
            || self.bank.is_some()
            || self.bik.is_some()
            || self.inn.is_some()
            || self.kpp.is_some()
            || self.provider_extra.is_some()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// Metadata travels as JSON text because bincode cannot decode self-describing
/// values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UnitRegistered {
        id: Ulid,
        slug: String,
        name: String,
        currency: String,
        created_at: Ms,
    },
    UnitUpdated {
        name: String,
        currency: String,
    },
    PayoutSettingsUpdated {
        settings: PayoutSettings,
    },
    ServiceCreated {
        id: Ulid,
        title: String,
        category: String,
        price: Money,
        available: bool,
    },
    ServiceUpdated {
        id: Ulid,
        title: String,
        category: String,
        price: Money,
        available: bool,
    },
    ServiceDeleted {
        id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        service_id: Ulid,
        client: Client,
        span: Span,
        total_price: Money,
        created_at: Ms,
    },
    AppointmentUpdated {
        id: Ulid,
        from_service_id: Ulid,
        service_id: Ulid,
        client: Client,
        span: Span,
        total_price: Money,
    },
    AppointmentStatusChanged {
        id: Ulid,
        service_id: Ulid,
        status: AppointmentStatus,
    },
    PaymentStatusChanged {
        id: Ulid,
        service_id: Ulid,
        status: PaymentStatus,
        provider: Option<String>,
        reference: Option<String>,
        paid_amount: Option<Money>,
        paid_at: Option<Ms>,
        meta: String,
    },
    AppointmentDeleted {
        id: Ulid,
        service_id: Ulid,
    },
    PayoutRequested {
        id: Ulid,
        amount: Money,
        currency: String,
        comment: Option<String>,
        requested_by: Option<String>,
        created_at: Ms,
    },
    PayoutDispatched {
        id: Ulid,
        provider: String,
        provider_payout_id: String,
    },
    PayoutStatusChanged {
        id: Ulid,
        status: PayoutStatus,
        fee: Money,
        processed_at: Option<Ms>,
        meta: String,
    },
}

/// Parse metadata stored as JSON text; anything unreadable degrades to null.
pub fn meta_from_text(text: &str) -> serde_json::Value {
    if text.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or(serde_json::Value::Null)
}

pub fn meta_to_text(meta: &serde_json::Value) -> String {
    if meta.is_null() {
        String::new()
    } else {
        meta.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn appointment(start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            service_id: Ulid::new(),
            client: Client {
                name: "Anna".into(),
                phone: "+79990000000".into(),
                email: None,
            },
            span: Span::new(start, end),
            total_price: dec!(100),
            status: AppointmentStatus::Pending,
            payment: Payment::default(),
            created_at: 0,
        }
    }

    fn service_state() -> ServiceState {
        ServiceState::new(Service {
            id: Ulid::new(),
            title: "Room 1".into(),
            category: DEFAULT_CATEGORY.into(),
            price: dec!(100),
            available: true,
        })
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn appointments_stay_sorted() {
        let mut ss = service_state();
        ss.insert_appointment(appointment(300, 400));
        ss.insert_appointment(appointment(100, 200));
        ss.insert_appointment(appointment(200, 300));
        let starts: Vec<Ms> = ss.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_adjacent_and_far() {
        let mut ss = service_state();
        ss.insert_appointment(appointment(0, 100));
        ss.insert_appointment(appointment(90, 210));
        ss.insert_appointment(appointment(300, 400));
        let hits: Vec<_> = ss.overlapping(&Span::new(100, 300)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(90, 210));
    }

    #[test]
    fn remove_missing_appointment_is_none() {
        let mut ss = service_state();
        ss.insert_appointment(appointment(0, 100));
        assert!(ss.remove_appointment(Ulid::new()).is_none());
        assert_eq!(ss.appointments.len(), 1);
    }

    #[test]
    fn appointment_transitions() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Pending));
    }

    #[test]
    fn payment_transitions() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Paid.can_transition_to(Refunded));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Paid));
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Pending));
    }

    #[test]
    fn cancelled_paid_appointment_leaves_balance() {
        let mut a = appointment(0, 100);
        a.payment.status = PaymentStatus::Paid;
        assert!(a.counts_toward_balance());
        a.status = AppointmentStatus::Cancelled;
        assert!(!a.counts_toward_balance());
    }

    #[test]
    fn balance_arithmetic() {
        let b = Balance::new(dec!(5000), dec!(1000), dec!(0));
        assert_eq!(b.available, dec!(4000));
        let negative = Balance::new(dec!(100), dec!(0), dec!(300));
        assert_eq!(negative.available, dec!(-200));
    }

    #[test]
    fn amount_after_fee() {
        let p = PayoutRequest {
            id: Ulid::new(),
            amount: dec!(1000),
            fee: dec!(15.50),
            currency: DEFAULT_CURRENCY.into(),
            status: PayoutStatus::Pending,
            provider: DEFAULT_PROVIDER.into(),
            provider_payout_id: None,
            meta: serde_json::Value::Null,
            comment: None,
            requested_by: None,
            created_at: 0,
            processed_at: None,
        };
        assert_eq!(p.amount_after_fee(), dec!(984.50));
    }

    #[test]
    fn settings_debug_redacts_secrets() {
        let settings = PayoutSettings {
            provider_secret: "sk_live_123".into(),
            webhook_secret: "whsec_456".into(),
            ..PayoutSettings::default()
        };
        let shown = format!("{settings:?}");
        assert!(!shown.contains("sk_live_123"));
        assert!(!shown.contains("whsec_456"));
    }

    #[test]
    fn event_with_money_survives_bincode() {
        let event = Event::PayoutRequested {
            id: Ulid::new(),
            amount: dec!(1234.56),
            currency: DEFAULT_CURRENCY.into(),
            comment: Some("weekly".into()),
            requested_by: None,
            created_at: 42,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn meta_text_helpers() {
        assert!(meta_from_text("").is_null());
        assert!(meta_from_text("{not json").is_null());
        let v = serde_json::json!({"a": 1});
        assert_eq!(meta_from_text(&meta_to_text(&v)), v);
        assert_eq!(meta_to_text(&serde_json::Value::Null), "");
    }
}
