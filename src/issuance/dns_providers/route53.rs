use std::error::Error as StdError;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_route53::Client;
use aws_sdk_route53::config::{Credentials, Region};
use aws_sdk_route53::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use log::{debug, info};

use super::{
    ChangeHandle, DnsError, DnsManagerFactory, DnsRecordManager, ZoneHandle, clamp_ttl,
    format_txt_value, normalize_record_name, normalize_txt_value,
};
use crate::domain::longest_matching_zone;
use crate::secrets::types::DnsCredentials;

const CHANGE_COMMENT: &str = "Created by CertPilot";
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "PriorRequestNotComplete",
    "ServiceUnavailable",
];

/// Route 53 record manager bound to one credential set.
#[derive(Clone)]
pub struct Route53Manager {
    client: Client,
}

impl Route53Manager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn from_credentials(credentials: &DnsCredentials) -> Self {
        let provider = Credentials::new(
            &credentials.access_key_id,
            credentials.secret_access_key.as_str(),
            None,
            None,
            "certpilot",
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(provider)
            .region(Region::new(credentials.region.clone()))
            .load()
            .await;
        Self::new(Client::new(&config))
    }

    async fn list_zones(&self) -> Result<Vec<ZoneHandle>, DnsError> {
        let mut zones = Vec::new();
        let mut paginator = self
            .client
            .list_hosted_zones()
            .into_paginator()
            .page_size(100)
            .send();

        while let Some(page) = paginator.next().await {
            let page = page.map_err(|err| classify("list hosted zones", err))?;
            for zone in page.hosted_zones() {
                let private = zone
                    .config()
                    .is_some_and(|config| config.private_zone());
                if private {
                    continue;
                }
                zones.push(ZoneHandle {
                    id: zone.id().trim_start_matches("/hostedzone/").to_string(),
                    name: zone.name().trim_end_matches('.').to_string(),
                });
            }
        }
        Ok(zones)
    }

    async fn find_txt_set(
        &self,
        zone: &ZoneHandle,
        name: &str,
    ) -> Result<Option<ResourceRecordSet>, DnsError> {
        let response = self
            .client
            .list_resource_record_sets()
            .hosted_zone_id(&zone.id)
            .start_record_name(name)
            .start_record_type(RrType::Txt)
            .max_items(1)
            .send()
            .await
            .map_err(|err| classify("list TXT records", err))?;

        let wanted = normalize_record_name(name);
        Ok(response
            .resource_record_sets()
            .iter()
            .find(|set| normalize_record_name(set.name()) == wanted && set.r#type() == &RrType::Txt)
            .cloned())
    }

    async fn submit(
        &self,
        zone: &ZoneHandle,
        action: ChangeAction,
        record_set: ResourceRecordSet,
    ) -> Result<ChangeHandle, DnsError> {
        let name = normalize_record_name(record_set.name());
        let change = Change::builder()
            .action(action)
            .resource_record_set(record_set)
            .build()
            .map_err(|e| DnsError::Provider(format!("failed to build Change: {e}")))?;
        let batch = ChangeBatch::builder()
            .comment(CHANGE_COMMENT)
            .changes(change)
            .build()
            .map_err(|e| DnsError::Provider(format!("failed to build ChangeBatch: {e}")))?;

        self.client
            .change_resource_record_sets()
            .hosted_zone_id(&zone.id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|err| classify("change resource record sets", err))?;
        Ok(ChangeHandle {
            id: format!("{}:{name}", zone.id),
        })
    }
}

fn txt_record_set(name: &str, values: &[String], ttl: i64) -> Result<ResourceRecordSet, DnsError> {
    let records = values
        .iter()
        .map(|value| {
            ResourceRecord::builder()
                .value(format_txt_value(value))
                .build()
                .map_err(|e| DnsError::Provider(format!("failed to build ResourceRecord: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    ResourceRecordSet::builder()
        .name(name)
        .set_type(Some(RrType::Txt))
        .ttl(ttl)
        .set_resource_records(Some(records))
        .build()
        .map_err(|e| DnsError::Provider(format!("failed to build ResourceRecordSet: {e}")))
}

fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> DnsError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: Debug,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        _ => err.code().is_some_and(|code| TRANSIENT_CODES.contains(&code)),
    };
    let detail = format!("Route 53 {operation} failed: {}", DisplayErrorContext(&err));
    if transient {
        DnsError::Transient(detail)
    } else {
        DnsError::Provider(detail)
    }
}

#[async_trait]
impl DnsRecordManager for Route53Manager {
    async fn resolve_hosted_zone(&self, domain: &str) -> Result<ZoneHandle, DnsError> {
        let zones = self.list_zones().await?;
        let best = longest_matching_zone(domain, zones.iter().map(|zone| zone.name.as_str()))
            .map(str::to_string)
            .ok_or_else(|| DnsError::ZoneNotFound(domain.to_string()))?;
        let zone = zones
            .into_iter()
            .find(|zone| zone.name == best)
            .ok_or_else(|| DnsError::ZoneNotFound(domain.to_string()))?;
        debug!("[route53] {domain} resolved to zone {} ({})", zone.name, zone.id);
        Ok(zone)
    }

    async fn upsert_txt(
        &self,
        zone: &ZoneHandle,
        name: &str,
        value: &str,
        ttl: u32,
    ) -> Result<ChangeHandle, DnsError> {
        let record_set = txt_record_set(name, &[value.to_string()], i64::from(clamp_ttl(ttl)))?;
        let handle = self.submit(zone, ChangeAction::Upsert, record_set).await?;
        info!("[route53] upserted TXT {name} in zone {}", zone.id);
        Ok(handle)
    }

    async fn delete_txt(&self, zone: &ZoneHandle, name: &str, value: &str) -> Result<(), DnsError> {
        let Some(existing) = self.find_txt_set(zone, name).await? else {
            debug!("[route53] TXT {name} already absent");
            return Ok(());
        };
        let wanted = normalize_txt_value(value);
        let values: Vec<String> = existing
            .resource_records()
            .iter()
            .map(|record| normalize_txt_value(record.value()))
            .collect();
        if !values.iter().any(|v| *v == wanted) {
            debug!("[route53] TXT {name} no longer holds the challenge value");
            return Ok(());
        }

        let remaining: Vec<String> = values.into_iter().filter(|v| *v != wanted).collect();
        if remaining.is_empty() {
            self.submit(zone, ChangeAction::Delete, existing).await?;
        } else {
            let ttl = existing.ttl().unwrap_or(i64::from(clamp_ttl(60)));
            let record_set = txt_record_set(name, &remaining, ttl)?;
            self.submit(zone, ChangeAction::Upsert, record_set).await?;
        }
        info!("[route53] removed challenge value from TXT {name} in zone {}", zone.id);
        Ok(())
    }
}

/// Builds a fresh Route 53 client for every credential set.
#[derive(Default)]
pub struct Route53Factory;

#[async_trait]
impl DnsManagerFactory for Route53Factory {
    async fn manager_for(
        &self,
        credentials: &DnsCredentials,
    ) -> Result<Arc<dyn DnsRecordManager>, DnsError> {
        Ok(Arc::new(Route53Manager::from_credentials(credentials).await))
    }
}
