use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tempfile::TempDir;

use certpilot::config::{IssuancePolicy, PropagationPolicy};
use certpilot::core::IssuanceService;
use certpilot::core::types::CertificateRequest;
use certpilot::distribution::DirectoryInstaller;
use certpilot::issuance::acme::{
    AccountHandle, AuthorizationView, CaError, CaOrder, CertificateAuthority, DnsChallenge,
    OrderState, ValidationState,
};
use certpilot::issuance::dns::{TxtAnswer, TxtResolver};
use certpilot::issuance::dns_providers::{DnsError, MemoryDnsManager, StaticDnsFactory};
use certpilot::issuance::retry::RetryPolicy;
use certpilot::secrets::{DnsCredentials, MemorySecretProvider};
use certpilot::storage::{CertificateStore, Db, RequestStore};

pub const TENANT: &str = "tenant-a";
pub const CONTACT: &str = "ops@example.test";

/// RFC 8555 §8.4 style vector: token, account thumbprint and the resulting TXT value.
pub const TOKEN: &str = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA";
pub const THUMBPRINT: &str = "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs";
pub const EXPECTED_DIGEST: &str = "ZTRx1Ckl1-tM05o5zaizTTA0yUy5AGereMgSNWC6Ll8";

const SETTLE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaBehavior {
    /// Validates as soon as the challenge record is present.
    Valid,
    /// Marks the challenge invalid after notification.
    Invalid,
    /// Never finishes validation.
    NeverReady,
    /// Offers only an http-01 challenge.
    NoDns01,
    /// The authorization is already valid from an earlier order.
    AlreadyValid,
    /// Validates, then refuses the CSR at finalization.
    FinalizeRejected,
    /// Accepts the CSR but never makes the chain available.
    ChainNeverReady,
    /// The CA client crashes while finalizing.
    PanicOnFinalize,
}

#[derive(Default)]
struct CaState {
    accounts: Vec<String>,
    orders: usize,
    notified: usize,
    finalized: usize,
    failing_orders: usize,
    order_attempts: usize,
}

/// Scripted certificate authority that checks the published TXT record the
/// way a real CA would.
pub struct FakeCa {
    behavior: CaBehavior,
    dns: Arc<MemoryDnsManager>,
    state: Arc<Mutex<CaState>>,
}

impl FakeCa {
    pub fn new(behavior: CaBehavior, dns: Arc<MemoryDnsManager>) -> Self {
        Self {
            behavior,
            dns,
            state: Arc::new(Mutex::new(CaState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, CaState> {
        self.state.lock().unwrap()
    }

    pub fn orders(&self) -> usize {
        self.state().orders
    }

    pub fn accounts(&self) -> Vec<String> {
        self.state().accounts.clone()
    }

    /// Number of challenges the CA was asked to validate.
    pub fn notified(&self) -> usize {
        self.state().notified
    }

    pub fn finalized(&self) -> usize {
        self.state().finalized
    }

    /// Makes the next `count` order creations fail with a CA-side 503.
    pub fn fail_next_orders(&self, count: usize) {
        self.state().failing_orders = count;
    }

    /// Order creations attempted, including failed ones.
    pub fn order_attempts(&self) -> usize {
        self.state().order_attempts
    }
}

#[async_trait]
impl CertificateAuthority for FakeCa {
    fn directory_url(&self) -> &str {
        "https://ca.test/directory"
    }

    async fn ensure_account(&self, contact_email: &str) -> Result<AccountHandle, CaError> {
        let mut state = self.state();
        let index = match state.accounts.iter().position(|known| known == contact_email) {
            Some(index) => index,
            None => {
                state.accounts.push(contact_email.to_string());
                state.accounts.len() - 1
            }
        };
        Ok(AccountHandle {
            id: format!("https://ca.test/acct/{index}"),
            contact_email: contact_email.to_string(),
        })
    }

    async fn new_order(
        &self,
        _account: &AccountHandle,
        domain: &str,
    ) -> Result<Box<dyn CaOrder>, CaError> {
        let mut state = self.state();
        state.order_attempts += 1;
        if state.failing_orders > 0 {
            state.failing_orders -= 1;
            return Err(CaError::Transient(
                "CA problem: API error: service unavailable (HTTP 503)".into(),
            ));
        }
        state.orders += 1;
        Ok(Box::new(FakeOrder {
            url: format!("https://ca.test/order/{}", state.orders),
            domain: domain.to_string(),
            behavior: self.behavior,
            dns: self.dns.clone(),
            ca: self.state.clone(),
            progress: Mutex::new(OrderProgress::default()),
        }))
    }
}

#[derive(Default)]
struct OrderProgress {
    notified: bool,
    rejected: Option<String>,
    finalized: bool,
}

struct FakeOrder {
    url: String,
    domain: String,
    behavior: CaBehavior,
    dns: Arc<MemoryDnsManager>,
    ca: Arc<Mutex<CaState>>,
    progress: Mutex<OrderProgress>,
}

impl FakeOrder {
    fn progress(&self) -> MutexGuard<'_, OrderProgress> {
        self.progress.lock().unwrap()
    }

    /// Behaviors that validate a correctly published record.
    fn validates(&self) -> bool {
        matches!(
            self.behavior,
            CaBehavior::Valid
                | CaBehavior::FinalizeRejected
                | CaBehavior::ChainNeverReady
                | CaBehavior::PanicOnFinalize
        )
    }

    fn challenge_status(&self, progress: &OrderProgress) -> ValidationState {
        if progress.rejected.is_some() {
            ValidationState::Invalid
        } else if self.behavior == CaBehavior::AlreadyValid
            || (progress.notified && self.validates())
        {
            ValidationState::Valid
        } else if progress.notified {
            ValidationState::Processing
        } else {
            ValidationState::Pending
        }
    }
}

#[async_trait]
impl CaOrder for FakeOrder {
    fn url(&self) -> &str {
        &self.url
    }

    async fn authorizations(&self) -> Result<Vec<AuthorizationView>, CaError> {
        let progress = self.progress();
        let status = self.challenge_status(&progress);
        let dns01 = (self.behavior != CaBehavior::NoDns01).then(|| DnsChallenge {
            url: format!("{}/chall/dns", self.url),
            token: TOKEN.to_string(),
            key_authorization: format!("{TOKEN}.{THUMBPRINT}"),
            error: progress.rejected.clone(),
        });
        Ok(vec![AuthorizationView { status, dns01 }])
    }

    async fn set_challenge_ready(&self, _challenge_url: &str) -> Result<(), CaError> {
        self.ca.lock().unwrap().notified += 1;
        let record_name = format!("_acme-challenge.{}", self.domain);
        let published = self
            .dns
            .records()
            .iter()
            .any(|record| record.name == record_name && record.value == EXPECTED_DIGEST);

        let mut progress = self.progress();
        progress.notified = true;
        if self.behavior == CaBehavior::Invalid {
            progress.rejected =
                Some("urn:ietf:params:acme:error:unauthorized: incorrect TXT record".into());
        } else if self.validates() && !published {
            progress.rejected = Some(format!("no TXT record found at {record_name}"));
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<OrderState, CaError> {
        let progress = self.progress();
        if progress.finalized {
            return Ok(OrderState::Valid);
        }
        Ok(match self.challenge_status(&progress) {
            ValidationState::Valid => OrderState::Ready,
            ValidationState::Invalid => OrderState::Invalid,
            ValidationState::Pending | ValidationState::Processing => OrderState::Pending,
        })
    }

    async fn finalize(&self, csr_der: &[u8]) -> Result<(), CaError> {
        if csr_der.is_empty() {
            return Err(CaError::Rejected("empty CSR".into()));
        }
        match self.behavior {
            CaBehavior::FinalizeRejected => {
                return Err(CaError::Rejected(
                    "CA problem: API error: CSR does not meet policy (urn:ietf:params:acme:error:badCSR)"
                        .into(),
                ));
            }
            CaBehavior::PanicOnFinalize => panic!("CA client crashed during finalize"),
            _ => {}
        }
        self.progress().finalized = true;
        self.ca.lock().unwrap().finalized += 1;
        Ok(())
    }

    async fn certificate(&self) -> Result<Option<String>, CaError> {
        if !self.progress().finalized || self.behavior == CaBehavior::ChainNeverReady {
            return Ok(None);
        }
        sample_chain(&self.domain)
            .map(Some)
            .map_err(|err| CaError::Protocol(err.to_string()))
    }
}

/// Leaf for `domain` followed by a throwaway issuer.
pub fn sample_chain(domain: &str) -> Result<String> {
    let mut ca_params = CertificateParams::new(vec!["Fake Test CA".to_string()])?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate()?;
    let ca = ca_params.self_signed(&ca_key)?;

    let leaf_key = KeyPair::generate()?;
    let leaf = CertificateParams::new(vec![domain.to_string()])?.signed_by(&leaf_key, &ca, &ca_key)?;
    Ok(format!("{}{}", leaf.pem(), ca.pem()))
}

/// Answers TXT queries from the in-memory zone, i.e. instant propagation.
pub struct ZoneMirrorResolver {
    dns: Arc<MemoryDnsManager>,
}

impl ZoneMirrorResolver {
    pub fn new(dns: Arc<MemoryDnsManager>) -> Self {
        Self { dns }
    }
}

#[async_trait]
impl TxtResolver for ZoneMirrorResolver {
    async fn lookup_txt(&self, name: &str) -> Result<TxtAnswer, DnsError> {
        let wanted = name.trim_end_matches('.').to_ascii_lowercase();
        let values: Vec<String> = self
            .dns
            .records()
            .into_iter()
            .filter(|record| record.name == wanted)
            .map(|record| record.value)
            .collect();
        Ok(if values.is_empty() {
            TxtAnswer::NxDomain
        } else {
            TxtAnswer::Records(values)
        })
    }
}

/// A resolver that never sees the record.
pub struct BlindResolver;

#[async_trait]
impl TxtResolver for BlindResolver {
    async fn lookup_txt(&self, _name: &str) -> Result<TxtAnswer, DnsError> {
        Ok(TxtAnswer::NoRecord)
    }
}

pub fn fast_policy() -> IssuancePolicy {
    IssuancePolicy {
        txt_ttl: 60,
        propagation_prewait: Duration::ZERO,
        propagation_attempts: 3,
        propagation_interval: Duration::from_millis(5),
        propagation_policy: PropagationPolicy::Proceed,
        propagation_grace: Duration::ZERO,
        validation_timeout: Duration::from_secs(5),
        validation_poll: Duration::from_millis(10),
        certificate_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(2),
        },
    }
}

pub struct HarnessOptions {
    pub behavior: CaBehavior,
    pub zones: Vec<&'static str>,
    pub resolver_sees_records: bool,
    pub policy: IssuancePolicy,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            behavior: CaBehavior::Valid,
            zones: vec!["test."],
            resolver_sees_records: true,
            policy: fast_policy(),
        }
    }
}

pub struct Harness {
    pub service: IssuanceService,
    pub dns: Arc<MemoryDnsManager>,
    pub ca: Arc<FakeCa>,
    pub requests: RequestStore,
    pub install_root: std::path::PathBuf,
    pub cert_root: std::path::PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let db = Db::initialize_with_path(&dir.path().join("data"))?;
        let requests = RequestStore::new(db);
        let dns = Arc::new(MemoryDnsManager::new(options.zones));
        let ca = Arc::new(FakeCa::new(options.behavior, dns.clone()));
        let resolver: Arc<dyn TxtResolver> = if options.resolver_sees_records {
            Arc::new(ZoneMirrorResolver::new(dns.clone()))
        } else {
            Arc::new(BlindResolver)
        };
        let secrets = MemorySecretProvider::new()
            .with_tenant(TENANT, DnsCredentials::new("AKIDEXAMPLE", "secret"));
        let install_root = dir.path().join("installed");
        let cert_root = dir.path().join("certs");

        let service = IssuanceService::builder(
            requests.clone(),
            CertificateStore::new(&cert_root),
            Arc::new(secrets),
            Arc::new(StaticDnsFactory::new(dns.clone())),
            ca.clone(),
            resolver,
        )
        .policy(options.policy)
        .installer(Arc::new(DirectoryInstaller::new(&install_root)))
        .max_workers(2)
        .build();

        Ok(Self {
            service,
            dns,
            ca,
            requests,
            install_root,
            cert_root,
            _dir: dir,
        })
    }

    pub async fn settle(&self, request_id: &str) -> Result<CertificateRequest> {
        tokio::time::timeout(
            SETTLE_TIMEOUT,
            self.service
                .wait_until_settled(request_id, Duration::from_millis(10)),
        )
        .await
        .map_err(|_| anyhow!("request {request_id} did not settle in time"))?
    }

    /// Polls until the stored request reaches `status`.
    pub async fn wait_for_status(
        &self,
        request_id: &str,
        status: certpilot::RequestStatus,
    ) -> Result<CertificateRequest> {
        let poll = async {
            loop {
                let request = self.requests.require(request_id)?;
                if request.status == status {
                    return Ok::<_, anyhow::Error>(request);
                }
                if request.status.is_terminal() {
                    return Err(anyhow!(
                        "request {request_id} ended in {} while waiting for {status}",
                        request.status
                    ));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(SETTLE_TIMEOUT, poll)
            .await
            .map_err(|_| anyhow!("request {request_id} never reached {status}"))?
    }
}
