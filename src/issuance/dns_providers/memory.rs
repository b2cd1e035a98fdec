use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;

use super::{
    ChangeHandle, DnsError, DnsManagerFactory, DnsRecordManager, ZoneHandle, clamp_ttl,
    normalize_record_name, normalize_txt_value,
};
use crate::domain::longest_matching_zone;
use crate::secrets::types::DnsCredentials;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecord {
    pub zone_id: String,
    pub name: String,
    pub value: String,
    pub ttl: u32,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<(String, String), TxtRecord>,
    upsert_calls: usize,
    delete_calls: usize,
    failing_upserts: usize,
}

/// In-process DNS provider. Useful for dry runs and as the provider behind tests.
#[derive(Clone)]
pub struct MemoryDnsManager {
    zones: Vec<ZoneHandle>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDnsManager {
    pub fn new<I, S>(zone_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let zones = zone_names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                let name: String = name.into();
                ZoneHandle {
                    id: format!("Z{:04}", idx + 1),
                    name: name.trim_end_matches('.').to_string(),
                }
            })
            .collect();
        Self {
            zones,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn records(&self) -> Vec<TxtRecord> {
        let mut records: Vec<TxtRecord> = self.state().records.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Makes the next `count` upserts fail the way a provider outage does.
    pub fn fail_next_upserts(&self, count: usize) {
        self.state().failing_upserts = count;
    }

    pub fn upsert_calls(&self) -> usize {
        self.state().upsert_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state().delete_calls
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DnsRecordManager for MemoryDnsManager {
    async fn resolve_hosted_zone(&self, domain: &str) -> Result<ZoneHandle, DnsError> {
        let best = longest_matching_zone(domain, self.zones.iter().map(|zone| zone.name.as_str()))
            .ok_or_else(|| DnsError::ZoneNotFound(domain.to_string()))?;
        self.zones
            .iter()
            .find(|zone| zone.name == best)
            .cloned()
            .ok_or_else(|| DnsError::ZoneNotFound(domain.to_string()))
    }

    async fn upsert_txt(
        &self,
        zone: &ZoneHandle,
        name: &str,
        value: &str,
        ttl: u32,
    ) -> Result<ChangeHandle, DnsError> {
        let mut state = self.state();
        state.upsert_calls += 1;
        if state.failing_upserts > 0 {
            state.failing_upserts -= 1;
            return Err(DnsError::Transient(format!(
                "provider unavailable (HTTP 503) while writing {name}"
            )));
        }
        let key = (zone.id.clone(), normalize_record_name(name));
        debug!("[dns-memory] upsert {} in {}", key.1, zone.id);
        state.records.insert(
            key.clone(),
            TxtRecord {
                zone_id: zone.id.clone(),
                name: key.1.clone(),
                value: normalize_txt_value(value),
                ttl: clamp_ttl(ttl),
            },
        );
        Ok(ChangeHandle {
            id: format!("change-{}", state.upsert_calls),
        })
    }

    async fn delete_txt(&self, zone: &ZoneHandle, name: &str, value: &str) -> Result<(), DnsError> {
        let mut state = self.state();
        state.delete_calls += 1;
        let key = (zone.id.clone(), normalize_record_name(name));
        let matches = state
            .records
            .get(&key)
            .is_some_and(|record| record.value == normalize_txt_value(value));
        if matches {
            state.records.remove(&key);
        }
        Ok(())
    }
}

/// Hands the same manager to every tenant.
pub struct StaticDnsFactory {
    manager: Arc<dyn DnsRecordManager>,
}

impl StaticDnsFactory {
    pub fn new(manager: Arc<dyn DnsRecordManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl DnsManagerFactory for StaticDnsFactory {
    async fn manager_for(
        &self,
        _credentials: &DnsCredentials,
    ) -> Result<Arc<dyn DnsRecordManager>, DnsError> {
        Ok(self.manager.clone())
    }
}
