use crate::limits::{MAX_META_BYTES, MAX_REGISTRATION_CODE_LEN};
use crate::model::*;

use super::{check_text_len, require_text, Engine, EngineError};

fn normalize_currency(code: &str) -> Result<String, EngineError> {
    let code = code.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(EngineError::Validation(format!(
            "currency must be a three-letter code, got {code:?}"
        )));
    }
    Ok(code)
}

/// Digits only, or empty when not configured.
fn check_registration_code(field: &'static str, code: &str) -> Result<(), EngineError> {
    if code.len() > MAX_REGISTRATION_CODE_LEN || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(EngineError::Validation(format!(
            "{field} must be at most {MAX_REGISTRATION_CODE_LEN} digits"
        )));
    }
    Ok(())
}

/// Provider options must be a JSON object. Stored compact; empty clears them.
fn normalize_provider_extra(raw: &str) -> Result<String, EngineError> {
    if raw.trim().is_empty() {
        return Ok(String::new());
    }
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        EngineError::Validation(format!("payout_provider_extra is not valid JSON: {e}"))
    })?;
    if !value.is_object() {
        return Err(EngineError::Validation(
            "payout_provider_extra must be a JSON object".into(),
        ));
    }
    let text = meta_to_text(&value);
    if text.len() > MAX_META_BYTES {
        return Err(EngineError::LimitExceeded("payout_provider_extra"));
    }
    Ok(text)
}

impl Engine {
    pub async fn business_unit(&self) -> BusinessUnit {
        self.unit.read().await.clone()
    }

    /// Change display name and/or currency. Absent fields keep their value.
    pub async fn update_unit(
        &self,
        name: Option<String>,
        currency: Option<String>,
    ) -> Result<BusinessUnit, EngineError> {
        let name = match name {
            Some(n) => {
                require_text("name", &n)?;
                Some(n.trim().to_string())
            }
            None => None,
        };
        let currency = currency.as_deref().map(normalize_currency).transpose()?;

        let _gate = self.compaction_gate.read().await;
        let mut unit = self.unit.write().await;
        let name = name.unwrap_or_else(|| unit.name.clone());
        let currency = currency.unwrap_or_else(|| unit.currency.clone());
        if name == unit.name && currency == unit.currency {
            return Ok(unit.clone());
        }
        let event = Event::UnitUpdated { name, currency };
        self.persist_to_unit(&mut unit, &event).await?;
        tracing::info!(tenant = %unit.slug, name = %unit.name, currency = %unit.currency, "business unit updated");
        Ok(unit.clone())
    }

    pub async fn update_payout_settings(
        &self,
        settings: PayoutSettings,
    ) -> Result<BusinessUnit, EngineError> {
        self.edit_payout_settings(|current| *current = settings).await
    }

    /// Apply a partial change set: profile fields first, then payout fields,
    /// each as its own atomic write.
    pub async fn apply_unit_changes(
        &self,
        changes: UnitChanges,
    ) -> Result<BusinessUnit, EngineError> {
        if changes.touches_profile() {
            self.update_unit(changes.name.clone(), changes.currency.clone())
                .await?;
        }
        if changes.touches_payout() {
            self.edit_payout_settings(|s| {
                if let Some(method) = changes.payout_method {
                    s.method = method;
                }
                if let Some(provider) = changes.payout_provider {
                    s.provider = provider;
                }
                if let Some(mode) = changes.payout_mode {
                    s.mode = mode;
                }
                if let Some(key) = changes.provider_key {
                    s.provider_key = key;
                }
                if let Some(secret) = changes.provider_secret {
                    s.provider_secret = secret;
                }
                if let Some(secret) = changes.webhook_secret {
                    s.webhook_secret = secret;
                }
                if let Some(account) = changes.account {
                    s.account = account;
                }
                if let Some(name) = changes.recipient_name {
                    s.recipient.name = name;
                }
                if let Some(bank) = changes.bank {
                    s.recipient.bank = bank;
                }
                if let Some(bik) = changes.bik {
                    s.recipient.bik = bik;
                }
                if let Some(inn) = changes.inn {
                    s.recipient.inn = inn;
                }
                if let Some(kpp) = changes.kpp {
                    s.recipient.kpp = kpp;
                }
                if let Some(extra) = changes.provider_extra {
                    s.provider_extra = extra;
                }
            })
            .await?;
        }
        Ok(self.business_unit().await)
    }

    async fn edit_payout_settings(
        &self,
        edit: impl FnOnce(&mut PayoutSettings),
    ) -> Result<BusinessUnit, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut unit = self.unit.write().await;

        let mut settings = unit.payout.clone();
        edit(&mut settings);
        settings.provider = settings.provider.trim().to_lowercase();
        if settings.provider.is_empty() {
            settings.provider = DEFAULT_PROVIDER.to_string();
        }
        if !self.providers.contains(&settings.provider) {
            return Err(EngineError::Validation(format!(
                "unknown payout provider {:?}",
                settings.provider
            )));
        }
        check_text_len("payout_provider_key", &settings.provider_key)?;
        check_text_len("payout_provider_secret", &settings.provider_secret)?;
        check_text_len("payout_webhook_secret", &settings.webhook_secret)?;
        check_text_len("payout_account", &settings.account)?;
        let recipient = &mut settings.recipient;
        for value in [
            &mut recipient.name,
            &mut recipient.bank,
            &mut recipient.bik,
            &mut recipient.inn,
            &mut recipient.kpp,
        ] {
            *value = value.trim().to_string();
        }
        check_text_len("payout_name", &recipient.name)?;
        check_text_len("payout_bank", &recipient.bank)?;
        check_registration_code("payout_bik", &recipient.bik)?;
        check_registration_code("payout_inn", &recipient.inn)?;
        check_registration_code("payout_kpp", &recipient.kpp)?;
        settings.provider_extra = normalize_provider_extra(&settings.provider_extra)?;

        if settings == unit.payout {
            return Ok(unit.clone());
        }
        let event = Event::PayoutSettingsUpdated { settings };
        self.persist_to_unit(&mut unit, &event).await?;
        tracing::info!(
            tenant = %unit.slug,
            provider = %unit.payout.provider,
            method = unit.payout.method.as_str(),
            mode = unit.payout.mode.as_str(),
            "payout settings updated"
        );
        Ok(unit.clone())
    }
}
