use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::provider::ProviderRegistry;

pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Keep `[A-Za-z0-9_-]` so a tenant name is always a safe file stem.
pub fn sanitize_tenant_name(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe)
}

/// Tenant registry: one Engine + WAL + compactor per business unit.
/// Tenant = database name on the SQL surface, path segment on webhooks.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    providers: Arc<ProviderRegistry>,
    dispatch_timeout: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self::with_providers(
            data_dir,
            compact_threshold,
            Arc::new(ProviderRegistry::with_defaults()),
            DEFAULT_DISPATCH_TIMEOUT,
        )
    }

    pub fn with_providers(
        data_dir: PathBuf,
        compact_threshold: u64,
        providers: Arc<ProviderRegistry>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            providers,
            dispatch_timeout,
        }
    }

    fn wal_path(&self, safe_name: &str) -> PathBuf {
        self.data_dir.join(format!("{safe_name}.wal"))
    }

    /// Get or lazily create the engine for a tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let name = sanitize_tenant_name(tenant)?;
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            tracing::warn!(tenant = %name, "tenant limit reached");
            return Err(io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let engine = Arc::new(Engine::new(
                    self.wal_path(&name),
                    &name,
                    self.providers.clone(),
                    self.dispatch_timeout,
                )?);
                v.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant = %name, "tenant loaded");
        Ok(engine)
    }

    /// Engine for a tenant that already exists, in memory or on disk.
    /// Never creates one.
    pub fn get_existing(&self, tenant: &str) -> io::Result<Option<Arc<Engine>>> {
        let name = sanitize_tenant_name(tenant)?;
        if let Some(engine) = self.engines.get(&name) {
            return Ok(Some(engine.value().clone()));
        }
        if !self.wal_path(&name).exists() {
            return Ok(None);
        }
        self.get_or_create(&name).map(Some)
    }
}
