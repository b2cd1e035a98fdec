//! Caller-facing issuance commands.
//!
//! [`IssuanceService::submit`] validates the request, enforces per-domain
//! exclusion and hands the work to a background task; callers poll
//! [`IssuanceService::status`] until the request settles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::config::{IssuancePolicy, Settings};
use crate::core::types::{
    CancelOutcome, CertificateRequest, DeleteOutcome, ErrorCode, InstallReport, RenewalStatus,
    RequestStatus,
};
use crate::distribution::{CertificateInstaller, DirectoryInstaller};
use crate::domain::normalize_domain_for_storage;
use crate::issuance::IssuanceError;
use crate::issuance::acme::{AcmeAuthority, CertificateAuthority};
use crate::issuance::dns::{TxtResolver, public_resolver};
use crate::issuance::dns_providers::{DnsManagerFactory, Route53Factory, ZoneHandle};
use crate::issuance::flow::{FlowControl, IssuanceFlow};
use crate::secrets::{EnvSecretProvider, SecretError, SecretProvider};
use crate::storage::{AccountStore, CertificateStore, Db, RequestStore};

/// Certificates expiring within this many days are due for renewal.
pub const DEFAULT_RENEWAL_WINDOW_DAYS: i64 = 30;

const RELEASE_POLL: Duration = Duration::from_millis(10);

struct ActiveIssuance {
    request_id: String,
    control: Arc<FlowControl>,
}

struct Inner {
    requests: RequestStore,
    certificates: CertificateStore,
    secrets: Arc<dyn SecretProvider>,
    dns_factory: Arc<dyn DnsManagerFactory>,
    authority: Arc<dyn CertificateAuthority>,
    resolver: Arc<dyn TxtResolver>,
    installer: Option<Arc<dyn CertificateInstaller>>,
    policy: IssuancePolicy,
    workers: Arc<Semaphore>,
    /// In-flight issuances by domain.
    active: Mutex<HashMap<String, ActiveIssuance>>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveIssuance>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct IssuanceService {
    inner: Arc<Inner>,
}

pub struct IssuanceServiceBuilder {
    requests: RequestStore,
    certificates: CertificateStore,
    secrets: Arc<dyn SecretProvider>,
    dns_factory: Arc<dyn DnsManagerFactory>,
    authority: Arc<dyn CertificateAuthority>,
    resolver: Arc<dyn TxtResolver>,
    installer: Option<Arc<dyn CertificateInstaller>>,
    policy: IssuancePolicy,
    max_workers: usize,
}

impl IssuanceServiceBuilder {
    pub fn installer(mut self, installer: Arc<dyn CertificateInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn policy(mut self, policy: IssuancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn build(self) -> IssuanceService {
        IssuanceService {
            inner: Arc::new(Inner {
                requests: self.requests,
                certificates: self.certificates,
                secrets: self.secrets,
                dns_factory: self.dns_factory,
                authority: self.authority,
                resolver: self.resolver,
                installer: self.installer,
                policy: self.policy,
                workers: Arc::new(Semaphore::new(self.max_workers)),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl IssuanceService {
    pub fn builder(
        requests: RequestStore,
        certificates: CertificateStore,
        secrets: Arc<dyn SecretProvider>,
        dns_factory: Arc<dyn DnsManagerFactory>,
        authority: Arc<dyn CertificateAuthority>,
        resolver: Arc<dyn TxtResolver>,
    ) -> IssuanceServiceBuilder {
        IssuanceServiceBuilder {
            requests,
            certificates,
            secrets,
            dns_factory,
            authority,
            resolver,
            installer: None,
            policy: IssuancePolicy::default(),
            max_workers: 4,
        }
    }

    /// Production wiring: SQLite under `data_dir`, Route 53, the configured
    /// ACME directory and public DNS-over-HTTPS resolvers.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let db = Db::initialize_with_path(&settings.data_dir)?;
        let authority = AcmeAuthority::new(settings.acme_directory.clone(), AccountStore::new(db.clone()));
        let mut builder = Self::builder(
            RequestStore::new(db),
            CertificateStore::new(&settings.cert_dir),
            Arc::new(EnvSecretProvider::new()),
            Arc::new(Route53Factory),
            Arc::new(authority),
            public_resolver(settings.http_timeout),
        )
        .policy(settings.policy.clone())
        .max_workers(settings.max_workers);
        if let Some(dir) = &settings.install_dir {
            builder = builder.installer(Arc::new(DirectoryInstaller::new(dir)));
        }
        info!(
            "[service] using ACME directory {} and certificate root {}",
            settings.acme_directory,
            settings.cert_dir.display()
        );
        Ok(builder.build())
    }

    /// Creates a `pending` request and starts issuance in the background.
    ///
    /// Fails without creating a request when the domain is invalid, the
    /// tenant has no credentials, or the domain already has an issuance in
    /// flight.
    pub async fn submit(
        &self,
        tenant_id: &str,
        domain: &str,
        contact_email: &str,
    ) -> Result<CertificateRequest, IssuanceError> {
        self.start(tenant_id, domain, contact_email, None).await
    }

    async fn start(
        &self,
        tenant_id: &str,
        domain: &str,
        contact_email: &str,
        renews: Option<&str>,
    ) -> Result<CertificateRequest, IssuanceError> {
        let domain = normalize_domain_for_storage(domain)
            .map_err(|err| IssuanceError::InvalidDomain(format!("{err:#}")))?;

        let credentials = self
            .inner
            .secrets
            .get_credentials(tenant_id)
            .await
            .map_err(|err| match err {
                SecretError::CredentialsNotFound(tenant) => {
                    IssuanceError::CredentialsNotFound(format!("tenant {tenant}"))
                }
                other => IssuanceError::CredentialsNotFound(other.to_string()),
            })?;
        let dns = self
            .inner
            .dns_factory
            .manager_for(&credentials)
            .await
            .map_err(|err| IssuanceError::DnsPublishFailed(format!("DNS client setup failed: {err}")))?;

        let control = Arc::new(FlowControl::new());
        let request = {
            let mut active = self.inner.active();
            if let Some(existing) = active.get(&domain) {
                return Err(IssuanceError::AlreadyInProgress(format!(
                    "{domain} is being issued by request {}",
                    existing.request_id
                )));
            }
            if let Some(existing) = self
                .inner
                .requests
                .find_active(&domain)
                .map_err(IssuanceError::storage)?
            {
                return Err(IssuanceError::AlreadyInProgress(format!(
                    "{domain} has unfinished request {}",
                    existing.id
                )));
            }
            let request = self
                .inner
                .requests
                .create(tenant_id, &domain, contact_email.trim())
                .map_err(IssuanceError::storage)?;
            active.insert(domain.clone(), ActiveIssuance {
                request_id: request.id.clone(),
                control: control.clone(),
            });
            request
        };
        if let Some(renewed) = renews {
            self.set_renewal(renewed, RenewalStatus::InProgress);
        }

        let flow = IssuanceFlow::new(
            self.inner.requests.clone(),
            self.inner.certificates.clone(),
            dns,
            self.inner.authority.clone(),
            self.inner.resolver.clone(),
            self.inner.policy.clone(),
            control,
        );
        let service = self.clone();
        let queued = request.clone();
        let renews = renews.map(str::to_string);
        tokio::spawn(async move {
            let _permit = service.inner.workers.clone().acquire_owned().await.ok();
            let request_id = queued.id.clone();
            let domain = queued.domain.clone();
            // The flow records its own outcome on the request.
            let issued = match tokio::spawn(async move { flow.run(queued).await }).await {
                Ok(outcome) => outcome.is_ok(),
                Err(err) => {
                    service.recover_crashed(&request_id, err).await;
                    false
                }
            };
            if let Some(renewed) = &renews {
                let next = if issued {
                    RenewalStatus::NotScheduled
                } else {
                    RenewalStatus::Failed
                };
                service.set_renewal(renewed, next);
            }
            service.release(&domain, &request_id);
        });

        info!("[service] accepted request {} for {domain} (tenant {tenant_id})", request.id);
        Ok(request)
    }

    fn release(&self, domain: &str, request_id: &str) {
        let mut active = self.inner.active();
        if active.get(domain).is_some_and(|entry| entry.request_id == request_id) {
            active.remove(domain);
        }
    }

    /// Fails a request whose issuance task died without recording an outcome.
    async fn recover_crashed(&self, request_id: &str, err: JoinError) {
        let cause = if err.is_panic() { "panicked" } else { "was aborted" };
        error!("[service] issuance task for request {request_id} {cause}");
        let request = match self.inner.requests.get(request_id) {
            Ok(Some(request)) if request.status.is_active() => request,
            Ok(_) => return,
            Err(err) => {
                error!("[service] could not load crashed request {request_id}: {err:#}");
                return;
            }
        };
        if let Err(err) = self.remove_stale_challenge(&request).await {
            warn!("[service] could not remove challenge record of request {request_id}: {err:#}");
        }
        let failure = IssuanceError::Interrupted(format!(
            "issuance task {cause} while the request was {}",
            request.status
        ));
        match self
            .inner
            .requests
            .mark_error(request_id, failure.code(), &failure.error_message())
        {
            Ok(_) => info!("[service] request {request_id} ({}) -> error (interrupted)", request.domain),
            Err(err) => error!("[service] could not record failure of request {request_id}: {err:#}"),
        }
    }

    fn set_renewal(&self, request_id: &str, renewal: RenewalStatus) {
        if let Err(err) = self.inner.requests.set_renewal_status(request_id, renewal) {
            warn!("[service] could not mark renewal of request {request_id} {renewal}: {err:#}");
        }
    }

    pub fn status(&self, request_id: &str) -> Result<Option<CertificateRequest>> {
        self.inner.requests.get(request_id)
    }

    pub fn list(&self, tenant_id: &str) -> Result<Vec<CertificateRequest>> {
        self.inner.requests.list_for_tenant(tenant_id)
    }

    /// True while a task in this process still owns the request.
    pub fn is_running(&self, request_id: &str) -> bool {
        self.inner
            .active()
            .values()
            .any(|entry| entry.request_id == request_id)
    }

    /// Polls until the request is terminal and its task has released the domain.
    pub async fn wait_until_settled(
        &self,
        request_id: &str,
        poll: Duration,
    ) -> Result<CertificateRequest> {
        loop {
            let request = self
                .status(request_id)?
                .ok_or_else(|| anyhow!("certificate request {request_id} not found"))?;
            if request.status.is_terminal() && !self.is_running(request_id) {
                return Ok(request);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn cancel(&self, request_id: &str) -> CancelOutcome {
        let control = self
            .inner
            .active()
            .values()
            .find(|entry| entry.request_id == request_id)
            .map(|entry| entry.control.clone());
        let outcome = match control {
            Some(control) => control.cancel(),
            None => CancelOutcome::NotRunning,
        };
        info!("[service] cancel request {request_id}: {outcome:?}");
        outcome
    }

    /// Cancels the request's issuance if one is running, then removes the row.
    ///
    /// A request that is already finalizing is left alone and reported as
    /// [`DeleteOutcome::Deferred`]; delete it again once it settles.
    pub async fn delete(&self, request_id: &str) -> Result<DeleteOutcome> {
        let Some(request) = self.inner.requests.get(request_id)? else {
            return Ok(DeleteOutcome::NotFound);
        };

        if self.is_running(request_id) {
            if self.cancel(request_id) == CancelOutcome::Deferred {
                info!("[service] delete of request {request_id} deferred until finalization ends");
                return Ok(DeleteOutcome::Deferred);
            }
            while self.is_running(request_id) {
                tokio::time::sleep(RELEASE_POLL).await;
            }
        } else if request.status.is_active() {
            if let Err(err) = self.remove_stale_challenge(&request).await {
                warn!("[service] could not remove challenge record of request {request_id}: {err:#}");
            }
        }

        self.inner.requests.delete(request_id)?;
        info!("[service] deleted request {request_id} ({})", request.domain);
        Ok(DeleteOutcome::Deleted)
    }

    /// Issued or installed certificates expiring within `window` of `now`
    /// that have no newer certificate for the same domain.
    pub fn renewal_due(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Vec<CertificateRequest>> {
        let cutoff = now
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.inner.requests.list_renewal_due(cutoff)
    }

    /// Marks every certificate returned by [`Self::renewal_due`] as `scheduled`.
    pub fn schedule_renewals(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Vec<CertificateRequest>> {
        let due = self.renewal_due(now, window)?;
        let mut scheduled = Vec::with_capacity(due.len());
        for request in due {
            let updated = if request.renewal_status == RenewalStatus::Scheduled {
                request
            } else {
                let updated = self
                    .inner
                    .requests
                    .set_renewal_status(&request.id, RenewalStatus::Scheduled)?;
                info!(
                    "[service] renewal of {} ({}) scheduled, expires {}",
                    updated.id,
                    updated.domain,
                    updated.expiry_date.map(|d| d.to_rfc3339()).unwrap_or_default()
                );
                updated
            };
            scheduled.push(updated);
        }
        Ok(scheduled)
    }

    /// Starts a replacement issuance for an issued or installed certificate.
    ///
    /// The original request tracks the replacement through its renewal
    /// status: `in_progress` while it runs, then `not_scheduled` on success
    /// or `failed`.
    pub async fn renew(&self, request_id: &str) -> Result<CertificateRequest> {
        let current = self.inner.requests.require(request_id)?;
        if !matches!(current.status, RequestStatus::Issued | RequestStatus::Installed) {
            bail!(
                "request {request_id} is {}; only issued certificates can be renewed",
                current.status
            );
        }
        if current.renewal_status == RenewalStatus::InProgress {
            bail!("renewal of request {request_id} is already running");
        }
        let renewal = self
            .start(
                &current.tenant_id,
                &current.domain,
                &current.contact_email,
                Some(request_id),
            )
            .await
            .map_err(|err| anyhow!(err))?;
        info!("[service] request {} renews {request_id} ({})", renewal.id, current.domain);
        Ok(renewal)
    }

    /// Installs an issued certificate onto every target; the request moves to
    /// `installed` only if all of them succeed.
    pub async fn install(&self, request_id: &str, targets: &[String]) -> Result<InstallReport> {
        let installer = self
            .inner
            .installer
            .clone()
            .ok_or_else(|| anyhow!("no certificate installer configured"))?;
        if targets.is_empty() {
            bail!("at least one install target is required");
        }
        let request = self.inner.requests.require(request_id)?;
        if request.status != RequestStatus::Issued {
            bail!(
                "request {request_id} is {}; only issued certificates can be installed",
                request.status
            );
        }
        let paths = request
            .paths()
            .ok_or_else(|| anyhow!("request {request_id} has no stored certificate files"))?;

        let mut warnings = Vec::new();
        let mut failed = false;
        for target in targets {
            match installer.install(target, &paths).await {
                Ok(target_warnings) => warnings.extend(target_warnings),
                Err(err) => {
                    failed = true;
                    warn!("[service] install of {request_id} onto {target} failed: {err:#}");
                    warnings.push(format!("{target}: {err:#}"));
                }
            }
        }

        let request = if failed {
            self.inner.requests.record_install_warnings(request_id, &warnings)?
        } else {
            self.inner
                .requests
                .mark_installed(request_id, Utc::now(), &warnings)?
        };
        Ok(InstallReport {
            request,
            installed: !failed,
            warnings,
        })
    }

    /// Moves issued or installed requests past their expiry date to `expired`.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<CertificateRequest>> {
        let due = self.inner.requests.list_expiring(now)?;
        let mut expired = Vec::with_capacity(due.len());
        for request in due {
            let updated = self.inner.requests.mark_expired(&request.id)?;
            info!("[service] request {} ({}) -> expired", updated.id, updated.domain);
            expired.push(updated);
        }
        Ok(expired)
    }

    /// Fails requests left in flight by a previous process and removes their
    /// challenge records.
    pub async fn recover_interrupted(&self) -> Result<Vec<CertificateRequest>> {
        let stale: Vec<CertificateRequest> = self
            .inner
            .requests
            .list_active()?
            .into_iter()
            .filter(|request| !self.is_running(&request.id))
            .collect();

        let mut recovered = Vec::with_capacity(stale.len());
        for request in stale {
            if let Err(err) = self.remove_stale_challenge(&request).await {
                warn!(
                    "[service] could not remove challenge record of request {}: {err:#}",
                    request.id
                );
            }
            let err = IssuanceError::Interrupted(format!(
                "process stopped while the request was {}",
                request.status
            ));
            let updated = self
                .inner
                .requests
                .mark_error(&request.id, ErrorCode::Interrupted, &err.error_message())
                .with_context(|| format!("failed to recover request {}", request.id))?;
            info!("[service] request {} ({}) -> error (interrupted)", updated.id, updated.domain);
            recovered.push(updated);
        }
        Ok(recovered)
    }

    async fn remove_stale_challenge(&self, request: &CertificateRequest) -> Result<()> {
        let (Some(zone_id), Some(zone_name), Some(record_name), Some(value)) = (
            request.zone_id.clone(),
            request.zone_name.clone(),
            request.challenge_record.as_deref(),
            request.expected_digest.as_deref(),
        ) else {
            return Ok(());
        };
        let credentials = self.inner.secrets.get_credentials(&request.tenant_id).await?;
        let dns = self.inner.dns_factory.manager_for(&credentials).await?;
        let zone = ZoneHandle {
            id: zone_id,
            name: zone_name,
        };
        dns.delete_txt(&zone, record_name, value).await?;
        info!("[service] removed stale challenge record {record_name}");
        Ok(())
    }
}
