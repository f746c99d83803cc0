use chrono::{DateTime, Datelike, Utc};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{now_ms, validate_range};
use super::{Engine, EngineError};

const REVENUE_MONTHS: u32 = 6;
const TOP_SERVICES: usize = 5;

fn utc(ms: Ms) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// `(year, month)` of the `count` calendar months ending with the one
/// containing `now`, oldest first.
fn last_months(now: Ms, count: u32) -> Vec<(i32, u32)> {
    let Some(now) = utc(now) else {
        return Vec::new();
    };
    let current = now.year() * 12 + now.month0() as i32;
    (0..count as i32)
        .rev()
        .map(|back| {
            let index = current - back;
            (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
        })
        .collect()
}

impl Engine {
    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let service_id = self
            .service_of_appointment(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let ss = self
            .get_service(&service_id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        let guard = ss.read().await;
        guard
            .appointment(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// Appointments matching the filter, newest first.
    pub async fn list_appointments(&self, filter: &AppointmentFilter) -> Vec<Appointment> {
        let mut out = Vec::new();
        for (service_id, ss) in self.service_handles() {
            if filter.service_id.is_some_and(|sid| sid != service_id) {
                continue;
            }
            let guard = ss.read().await;
            if guard.deleted {
                continue;
            }
            out.extend(guard.appointments.iter().filter(|a| filter.matches(a)).cloned());
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Admission check without booking. Fails on an invalid range.
    pub async fn is_admissible(
        &self,
        service_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = validate_range(start, end)?;
        let ss = self
            .get_service(&service_id)
            .ok_or_else(|| EngineError::not_found("service", service_id))?;
        let guard = ss.read().await;
        if guard.deleted {
            return Err(EngineError::not_found("service", service_id));
        }
        Ok(super::is_admissible(&guard, &span, exclude))
    }

    /// Dashboard figures as of now.
    pub async fn summary(&self) -> Summary {
        self.summary_at(now_ms()).await
    }

    /// Dashboard figures as of `now`. "Active" means confirmed and not yet
    /// over.
    pub async fn summary_at(&self, now: Ms) -> Summary {
        let months = last_months(now, REVENUE_MONTHS);
        let mut revenue_by_month: Vec<MonthlyRevenue> = months
            .iter()
            .map(|&(year, month)| MonthlyRevenue {
                month: format!("{year:04}-{month:02}"),
                revenue: Money::ZERO,
            })
            .collect();
        let mut summary = Summary {
            total_appointments: 0,
            active_appointments: 0,
            confirmed_revenue: Money::ZERO,
            services: 0,
            occupancy_rate: Money::ZERO,
            revenue_by_month: Vec::new(),
            weekday_bookings: [0; 7],
            top_services: Vec::new(),
        };
        let mut stats = Vec::new();

        for (_, ss) in self.service_handles() {
            let guard = ss.read().await;
            if guard.deleted {
                continue;
            }
            summary.services += 1;
            let mut service = ServiceStats {
                service_id: guard.service.id,
                title: guard.service.title.clone(),
                bookings: 0,
                revenue: Money::ZERO,
            };
            for appt in &guard.appointments {
                summary.total_appointments += 1;
                if appt.status != AppointmentStatus::Confirmed {
                    continue;
                }
                summary.confirmed_revenue += appt.total_price;
                service.bookings += 1;
                service.revenue += appt.total_price;
                if appt.span.end >= now {
                    summary.active_appointments += 1;
                }
                if let Some(start) = utc(appt.span.start) {
                    summary.weekday_bookings[start.weekday().num_days_from_monday() as usize] += 1;
                }
                if let Some(created) = utc(appt.created_at) {
                    let key = (created.year(), created.month());
                    if let Some(i) = months.iter().position(|m| *m == key) {
                        revenue_by_month[i].revenue += appt.total_price;
                    }
                }
            }
            stats.push(service);
        }

        if summary.services > 0 {
            let occupied = summary.active_appointments.min(summary.services);
            summary.occupancy_rate = (Money::from(occupied) * Money::ONE_HUNDRED
                / Money::from(summary.services))
            .round_dp(1);
        }
        stats.sort_by(|a, b| {
            b.bookings
                .cmp(&a.bookings)
                .then(b.revenue.cmp(&a.revenue))
                .then(a.service_id.cmp(&b.service_id))
        });
        stats.truncate(TOP_SERVICES);
        summary.revenue_by_month = revenue_by_month;
        summary.top_services = stats;
        summary
    }
}
