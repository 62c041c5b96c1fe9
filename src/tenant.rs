use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;

/// One engine per database name. Tenants share nothing: each has its own
/// profiles, events and WAL file under `data_dir`.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
}

/// Database names double as WAL file stems, so only characters that are safe
/// in a file name are accepted. Nothing is rewritten: two names never share a file.
fn validate_tenant_name(tenant: &str) -> io::Result<()> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    if tenant.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if let Some(bad) = tenant.chars().find(|c| !(c.is_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid character {bad:?} in tenant name {tenant:?}"),
        ));
    }
    Ok(())
}

impl TenantManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
        }
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Return the tenant's engine, replaying its WAL on first use.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        validate_tenant_name(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Two connections racing on a new tenant must not both open its WAL.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{tenant}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tracing::info!("tenant {tenant:?} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
