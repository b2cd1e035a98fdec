//! DNS-01 issuance state machine.
//!
//! One [`IssuanceFlow`] drives one [`CertificateRequest`] from `pending` to
//! `issued` or `error`:
//!
//! 1. resolve the hosted zone (before any CA traffic)
//! 2. load or register the account and open an order
//! 3. pick the `dns-01` challenge and publish its digest
//! 4. wait for the record to show up in public resolvers
//! 5. tell the CA the challenge is ready and poll the order
//! 6. finalize with a fresh key, download and store the chain
//!
//! The published TXT record is removed on every exit path once it may exist.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{error, info, warn};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{IssuancePolicy, PropagationPolicy};
use crate::core::types::{CancelOutcome, CertificateRequest, RequestStatus};
use crate::domain::challenge_record_name;
use crate::issuance::IssuanceError;
use crate::issuance::acme::{
    CaOrder, CertificateAuthority, DnsChallenge, OrderState, ValidationState,
};
use crate::issuance::challenge::{
    ChallengeError, compute_dns01_value, thumbprint_from_key_authorization,
};
use crate::issuance::csr::generate_csr;
use crate::issuance::dns::{TxtResolver, wait_for_txt};
use crate::issuance::dns_providers::{DnsError, DnsRecordManager, ZoneHandle};
use crate::issuance::retry::with_backoff;
use crate::storage::certificates::split_leaf;
use crate::storage::{
    CertificateMaterial, CertificateStore, ChallengeBookkeeping, IssuedCertificate, RequestStore,
};

/// Lifetime of certificates issued by the CA.
pub const CERTIFICATE_LIFETIME_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Finalizing,
    Cancelled,
}

/// Cancellation handle shared between a running flow and the service.
///
/// Cancelling stops every wait before `finalizing`. Once the flow has
/// started finalizing, cancellation is refused so the CA order is never left
/// half-finalized.
pub struct FlowControl {
    token: CancellationToken,
    phase: Mutex<Phase>,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            token: CancellationToken::new(),
            phase: Mutex::new(Phase::Running),
        }
    }
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) -> CancelOutcome {
        let mut phase = self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *phase {
            Phase::Finalizing => CancelOutcome::Deferred,
            Phase::Running | Phase::Cancelled => {
                *phase = Phase::Cancelled;
                self.token.cancel();
                CancelOutcome::Cancelled
            }
        }
    }

    /// Switches to the non-cancellable phase. Returns `false` if a cancel won the race.
    fn enter_finalizing(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *phase == Phase::Cancelled {
            return false;
        }
        *phase = Phase::Finalizing;
        true
    }
}

/// `None` when `timeout` reaches past what the clock can represent.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn next_poll_misses(deadline: Option<Instant>, poll: Duration) -> bool {
    match (deadline, Instant::now().checked_add(poll)) {
        (Some(deadline), Some(next)) => next > deadline,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// TXT record that may exist in the tenant's zone and must be removed.
struct PublishedChallenge {
    zone: ZoneHandle,
    record_name: String,
    value: String,
}

pub struct IssuanceFlow {
    requests: RequestStore,
    certificates: CertificateStore,
    dns: Arc<dyn DnsRecordManager>,
    authority: Arc<dyn CertificateAuthority>,
    resolver: Arc<dyn TxtResolver>,
    policy: IssuancePolicy,
    control: Arc<FlowControl>,
}

impl IssuanceFlow {
    pub fn new(
        requests: RequestStore,
        certificates: CertificateStore,
        dns: Arc<dyn DnsRecordManager>,
        authority: Arc<dyn CertificateAuthority>,
        resolver: Arc<dyn TxtResolver>,
        policy: IssuancePolicy,
        control: Arc<FlowControl>,
    ) -> Self {
        Self {
            requests,
            certificates,
            dns,
            authority,
            resolver,
            policy,
            control,
        }
    }

    /// Runs the request to a terminal state and returns the stored row.
    ///
    /// On failure the request is already marked `error` with the returned
    /// error's code and message.
    pub async fn run(&self, request: CertificateRequest) -> Result<CertificateRequest, IssuanceError> {
        info!("[flow] starting issuance {} for {}", request.id, request.domain);
        let mut published = None;
        let outcome = self.drive(&request, &mut published).await;

        if let Some(challenge) = &published {
            self.remove_challenge(&request, challenge).await;
        }

        let result = outcome.and_then(|issued| {
            self.requests.mark_issued(&request.id, &issued).map_err(|err| {
                IssuanceError::PersistenceFailed(format!(
                    "certificate written to {} but the request could not be updated: {err:#}",
                    issued.paths.cert_path
                ))
            })
        });

        match result {
            Ok(done) => {
                info!(
                    "[flow] request {} ({}) -> issued, expires {}",
                    done.id,
                    done.domain,
                    done.expiry_date.map(|d| d.to_rfc3339()).unwrap_or_default()
                );
                Ok(done)
            }
            Err(err) => {
                error!("[flow] request {} ({}) failed: {err}", request.id, request.domain);
                if let Err(store_err) =
                    self.requests
                        .mark_error(&request.id, err.code(), &err.error_message())
                {
                    error!(
                        "[flow] could not record failure of request {}: {store_err:#}",
                        request.id
                    );
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        request: &CertificateRequest,
        published: &mut Option<PublishedChallenge>,
    ) -> Result<IssuedCertificate, IssuanceError> {
        let domain = request.domain.as_str();
        let retry = &self.policy.retry;

        let zone = self
            .guarded(with_backoff("resolve hosted zone", retry, || {
                self.dns.resolve_hosted_zone(domain)
            }))
            .await?
            .map_err(|err| match err {
                DnsError::ZoneNotFound(_) => IssuanceError::ZoneNotFound(domain.to_string()),
                other => IssuanceError::DnsPublishFailed(format!(
                    "could not list hosted zones for {domain}: {other}"
                )),
            })?;

        let account = self
            .guarded(with_backoff("load ACME account", retry, || {
                self.authority.ensure_account(&request.contact_email)
            }))
            .await?
            .map_err(|err| {
                IssuanceError::AuthorityUnavailable(format!("account setup failed: {err}"))
            })?;
        let order = self
            .guarded(with_backoff("create order", retry, || {
                self.authority.new_order(&account, domain)
            }))
            .await?
            .map_err(|err| IssuanceError::AuthorityUnavailable(format!("order creation failed: {err}")))?;
        self.requests
            .record_order(&request.id, order.url())
            .map_err(IssuanceError::storage)?;

        let authorizations = self
            .guarded(with_backoff("fetch authorizations", retry, || order.authorizations()))
            .await?
            .map_err(|err| {
                IssuanceError::AuthorityUnavailable(format!("authorization fetch failed: {err}"))
            })?;
        let authorization = authorizations.into_iter().next().ok_or_else(|| {
            IssuanceError::ChallengeUnavailable(format!("CA returned no authorization for {domain}"))
        })?;

        match authorization.status {
            ValidationState::Valid => {
                info!("[flow] authorization for {domain} is already valid, skipping DNS challenge");
            }
            ValidationState::Invalid => {
                return Err(IssuanceError::ValidationFailed(format!(
                    "authorization for {domain} is already invalid"
                )));
            }
            ValidationState::Pending | ValidationState::Processing => {
                let challenge = authorization.dns01.ok_or_else(|| {
                    IssuanceError::ChallengeUnavailable(format!(
                        "CA offered no dns-01 challenge for {domain}"
                    ))
                })?;
                self.publish(request, &zone, &challenge, published).await?;
                self.await_propagation(request, published).await?;
                self.advance(request, RequestStatus::AwaitingCaValidation)?;
                self.guarded(with_backoff("notify challenge ready", retry, || {
                    order.set_challenge_ready(&challenge.url)
                }))
                .await?
                .map_err(|err| {
                    IssuanceError::ValidationFailed(format!("challenge notification failed: {err}"))
                })?;
            }
        }

        self.await_validation(order.as_ref()).await?;
        self.finalize(request, order.as_ref()).await
    }

    async fn publish(
        &self,
        request: &CertificateRequest,
        zone: &ZoneHandle,
        challenge: &DnsChallenge,
        published: &mut Option<PublishedChallenge>,
    ) -> Result<(), IssuanceError> {
        let invalid = |err: ChallengeError| IssuanceError::ChallengeUnavailable(format!("unusable dns-01 challenge: {err}"));
        let thumbprint =
            thumbprint_from_key_authorization(&challenge.token, &challenge.key_authorization)
                .map_err(invalid)?;
        let digest = compute_dns01_value(&challenge.token, thumbprint).map_err(invalid)?;
        let record_name = challenge_record_name(&request.domain);

        self.requests
            .record_challenge(&request.id, &ChallengeBookkeeping {
                token: challenge.token.clone(),
                digest: digest.clone(),
                zone_id: zone.id.clone(),
                zone_name: zone.name.clone(),
                record_name: record_name.clone(),
            })
            .map_err(IssuanceError::storage)?;

        // A failed or timed-out upsert may still have reached the provider.
        *published = Some(PublishedChallenge {
            zone: zone.clone(),
            record_name: record_name.clone(),
            value: digest.clone(),
        });
        let ttl = self.policy.txt_ttl;
        self.guarded(with_backoff("publish TXT record", &self.policy.retry, || {
            self.dns.upsert_txt(zone, &record_name, &digest, ttl)
        }))
        .await?
        .map_err(|err| IssuanceError::DnsPublishFailed(format!("{record_name}: {err}")))?;

        self.advance(request, RequestStatus::DnsChallengePublished)
    }

    async fn await_propagation(
        &self,
        request: &CertificateRequest,
        published: &Option<PublishedChallenge>,
    ) -> Result<(), IssuanceError> {
        self.advance(request, RequestStatus::AwaitingPropagation)?;
        let Some(challenge) = published else {
            return Ok(());
        };

        self.pause(self.policy.propagation_prewait).await?;
        let attempts = self.policy.propagation_attempts;
        let visible = match self
            .guarded(wait_for_txt(
                self.resolver.as_ref(),
                &challenge.record_name,
                &challenge.value,
                attempts,
                self.policy.propagation_interval,
            ))
            .await?
        {
            Ok(visible) => visible,
            Err(err) => {
                warn!("[flow] propagation check for {} failed: {err}", challenge.record_name);
                false
            }
        };
        if visible {
            return Ok(());
        }

        match self.policy.propagation_policy {
            PropagationPolicy::Fail => Err(IssuanceError::PropagationTimeout(format!(
                "{} not visible after {attempts} attempt(s)",
                challenge.record_name
            ))),
            PropagationPolicy::Proceed => {
                warn!(
                    "[flow] {} not visible after {attempts} attempt(s); notifying the CA after {}s",
                    challenge.record_name,
                    self.policy.propagation_grace.as_secs()
                );
                self.pause(self.policy.propagation_grace).await
            }
        }
    }

    /// Polls the order until it is ready for finalization.
    async fn await_validation(&self, order: &dyn CaOrder) -> Result<(), IssuanceError> {
        let deadline = deadline_after(self.policy.validation_timeout);
        loop {
            let state = self
                .guarded(with_backoff("poll order", &self.policy.retry, || order.refresh()))
                .await?
                .map_err(|err| IssuanceError::ValidationFailed(format!("order polling failed: {err}")))?;
            match state {
                OrderState::Ready => return Ok(()),
                OrderState::Invalid => {
                    return Err(IssuanceError::ValidationFailed(
                        self.rejection_detail(order).await,
                    ));
                }
                OrderState::Processing | OrderState::Valid => {
                    return Err(IssuanceError::FinalizeFailed(
                        "order was finalized outside this request".to_string(),
                    ));
                }
                OrderState::Pending => {}
            }
            if next_poll_misses(deadline, self.policy.validation_poll) {
                return Err(IssuanceError::ValidationFailed(format!(
                    "CA did not validate the challenge within {}s",
                    self.policy.validation_timeout.as_secs()
                )));
            }
            self.pause(self.policy.validation_poll).await?;
        }
    }

    async fn rejection_detail(&self, order: &dyn CaOrder) -> String {
        let from_challenge = match order.authorizations().await {
            Ok(authorizations) => authorizations
                .into_iter()
                .find_map(|authz| authz.dns01.and_then(|challenge| challenge.error)),
            Err(_) => None,
        };
        from_challenge.unwrap_or_else(|| "CA marked the order invalid".to_string())
    }

    async fn finalize(
        &self,
        request: &CertificateRequest,
        order: &dyn CaOrder,
    ) -> Result<IssuedCertificate, IssuanceError> {
        if !self.control.enter_finalizing() {
            return Err(IssuanceError::Cancelled("cancelled before finalization".to_string()));
        }
        self.advance(request, RequestStatus::Finalizing)?;

        let leaf = generate_csr(&request.domain)
            .map_err(|err| IssuanceError::FinalizeFailed(format!("CSR generation failed: {err}")))?;
        let timeout = self.policy.retry.attempt_timeout;
        match tokio::time::timeout(timeout, order.finalize(&leaf.csr_der)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(IssuanceError::FinalizeFailed(format!("finalize rejected: {err}")));
            }
            Err(_) => {
                return Err(IssuanceError::FinalizeFailed(format!(
                    "finalize timed out after {}s",
                    timeout.as_secs()
                )));
            }
        }

        let chain_pem = self.download_certificate(order).await?;
        let (cert_pem, fingerprint) = split_leaf(&chain_pem).map_err(|err| {
            IssuanceError::FinalizeFailed(format!("CA returned an unusable chain: {err}"))
        })?;
        let paths = self
            .certificates
            .save(&request.domain, &CertificateMaterial {
                cert_pem,
                key_pem: leaf.private_key_pem,
                chain_pem,
            })
            .map_err(|err| {
                IssuanceError::PersistenceFailed(format!(
                    "{err}; the certificate is issued, re-fetch it from order {}",
                    order.url()
                ))
            })?;

        let issue_date = Utc::now();
        Ok(IssuedCertificate {
            paths,
            issue_date,
            expiry_date: issue_date + chrono::Duration::days(CERTIFICATE_LIFETIME_DAYS),
            fingerprint,
        })
    }

    async fn download_certificate(&self, order: &dyn CaOrder) -> Result<String, IssuanceError> {
        let deadline = deadline_after(self.policy.certificate_timeout);
        let timeout = self.policy.retry.attempt_timeout;
        loop {
            match tokio::time::timeout(timeout, order.certificate()).await {
                Ok(Ok(Some(chain))) => return Ok(chain),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    return Err(IssuanceError::FinalizeFailed(format!(
                        "certificate download failed: {err}"
                    )));
                }
                Err(_) => {
                    return Err(IssuanceError::FinalizeFailed(format!(
                        "certificate download timed out after {}s",
                        timeout.as_secs()
                    )));
                }
            }
            if next_poll_misses(deadline, self.policy.validation_poll) {
                return Err(IssuanceError::FinalizeFailed(format!(
                    "certificate not available within {}s",
                    self.policy.certificate_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.policy.validation_poll).await;
        }
    }

    async fn remove_challenge(&self, request: &CertificateRequest, challenge: &PublishedChallenge) {
        let result = with_backoff("delete TXT record", &self.policy.retry, || {
            self.dns
                .delete_txt(&challenge.zone, &challenge.record_name, &challenge.value)
        })
        .await;
        match result {
            Ok(()) => info!(
                "[flow] removed challenge record {} for request {}",
                challenge.record_name, request.id
            ),
            Err(err) => warn!(
                "[flow] failed to remove challenge record {} for request {}: {err}",
                challenge.record_name, request.id
            ),
        }
    }

    fn advance(&self, request: &CertificateRequest, next: RequestStatus) -> Result<(), IssuanceError> {
        self.requests
            .transition(&request.id, next)
            .map_err(IssuanceError::storage)?;
        info!("[flow] request {} ({}) -> {next}", request.id, request.domain);
        Ok(())
    }

    async fn pause(&self, duration: Duration) -> Result<(), IssuanceError> {
        if duration.is_zero() {
            return Ok(());
        }
        self.guarded(tokio::time::sleep(duration)).await
    }

    /// Races `future` against cancellation of this flow.
    async fn guarded<T>(&self, future: impl Future<Output = T>) -> Result<T, IssuanceError> {
        tokio::select! {
            biased;
            _ = self.control.token.cancelled() => {
                Err(IssuanceError::Cancelled("cancelled by caller".to_string()))
            }
            value = future => Ok(value),
        }
    }
}
