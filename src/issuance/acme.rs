//! Certificate Authority seam and its ACME v2 implementation.
//!
//! The orchestrator talks to [`CertificateAuthority`] / [`CaOrder`] only, so
//! tests can script CA behavior without a network.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::issuance::retry::Retryable;
use crate::storage::{AccountStore, StoredAccount};

#[derive(Debug, Error)]
pub enum CaError {
    /// Network failure, rate limit or CA-side 5xx; worth another attempt.
    #[error("{0}")]
    Transient(String),
    /// The CA answered with a problem document that will not change on retry.
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Protocol(String),
}

impl Retryable for CaError {
    fn is_transient(&self) -> bool {
        matches!(self, CaError::Transient(_))
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        CaError::Transient(format!("{operation} timed out after {}s", after.as_secs()))
    }
}

impl From<instant_acme::Error> for CaError {
    fn from(err: instant_acme::Error) -> Self {
        match err {
            instant_acme::Error::Api(problem) => {
                let retryable_status = problem
                    .status
                    .is_some_and(|status| status == 429 || status >= 500);
                let bad_nonce = problem
                    .r#type
                    .as_deref()
                    .is_some_and(|kind| kind.ends_with(":badNonce"));
                let detail = format!("CA problem: {problem}");
                if retryable_status || bad_nonce {
                    CaError::Transient(detail)
                } else {
                    CaError::Rejected(detail)
                }
            }
            other => CaError::Transient(format!("ACME request failed: {other}")),
        }
    }
}

/// Registered CA account, identified by its contact email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountHandle {
    pub id: String,
    pub contact_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// The `dns-01` challenge of one authorization.
#[derive(Debug, Clone)]
pub struct DnsChallenge {
    pub url: String,
    pub token: String,
    /// `token.thumbprint` as computed by the ACME client for the account key.
    pub key_authorization: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthorizationView {
    pub status: ValidationState,
    /// `None` when the CA offered no `dns-01` challenge.
    pub dns01: Option<DnsChallenge>,
}

#[async_trait]
pub trait CaOrder: Send + Sync {
    /// Order URL, persisted as the request's order handle.
    fn url(&self) -> &str;
    async fn authorizations(&self) -> Result<Vec<AuthorizationView>, CaError>;
    async fn set_challenge_ready(&self, challenge_url: &str) -> Result<(), CaError>;
    async fn refresh(&self) -> Result<OrderState, CaError>;
    async fn finalize(&self, csr_der: &[u8]) -> Result<(), CaError>;
    /// PEM chain once the CA has issued it, `None` while still processing.
    async fn certificate(&self) -> Result<Option<String>, CaError>;
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    fn directory_url(&self) -> &str;

    /// Loads the account for `contact_email`, registering it on first use.
    async fn ensure_account(&self, contact_email: &str) -> Result<AccountHandle, CaError>;

    async fn new_order(
        &self,
        account: &AccountHandle,
        domain: &str,
    ) -> Result<Box<dyn CaOrder>, CaError>;
}

/// ACME v2 client backed by `instant-acme`, with accounts persisted in SQLite.
pub struct AcmeAuthority {
    directory_url: String,
    accounts: AccountStore,
    loaded: Mutex<HashMap<String, (Account, String)>>,
}

impl AcmeAuthority {
    pub fn new(directory_url: impl Into<String>, accounts: AccountStore) -> Self {
        Self {
            directory_url: directory_url.into(),
            accounts,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    async fn load_or_create(&self, contact_email: &str) -> Result<(Account, String), CaError> {
        let stored = self
            .accounts
            .find(contact_email, &self.directory_url)
            .map_err(|err| CaError::Protocol(format!("failed to read ACME account: {err:#}")))?;

        if let Some(stored) = stored {
            let credentials: AccountCredentials = serde_json::from_str(&stored.credentials_json)
                .map_err(|err| {
                    CaError::Protocol(format!("stored ACME account is unreadable: {err}"))
                })?;
            let account = Account::from_credentials(credentials).await?;
            debug!("[acme] loaded account {} for {contact_email}", stored.account_id);
            return Ok((account, stored.account_id));
        }

        let contact = format!("mailto:{contact_email}");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let credentials_json = serde_json::to_string(&credentials)
            .map_err(|err| CaError::Protocol(format!("failed to serialize ACME account: {err}")))?;
        let account_id = account.id().to_string();
        self.accounts
            .save(contact_email, &self.directory_url, &StoredAccount {
                account_id: account_id.clone(),
                credentials_json,
            })
            .map_err(|err| CaError::Protocol(format!("failed to persist ACME account: {err:#}")))?;
        info!("[acme] registered account {account_id} for {contact_email}");
        Ok((account, account_id))
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn ensure_account(&self, contact_email: &str) -> Result<AccountHandle, CaError> {
        let mut loaded = self.loaded.lock().await;
        let id = match loaded.get(contact_email) {
            Some((_, id)) => id.clone(),
            None => {
                let (account, id) = self.load_or_create(contact_email).await?;
                loaded.insert(contact_email.to_string(), (account, id.clone()));
                id
            }
        };
        Ok(AccountHandle {
            id,
            contact_email: contact_email.to_string(),
        })
    }

    async fn new_order(
        &self,
        account: &AccountHandle,
        domain: &str,
    ) -> Result<Box<dyn CaOrder>, CaError> {
        let acme_account = self
            .loaded
            .lock()
            .await
            .get(&account.contact_email)
            .map(|(account, _)| account.clone())
            .ok_or_else(|| {
                CaError::Protocol(format!("account {} is not loaded", account.contact_email))
            })?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let order = acme_account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        let url = order.url().to_string();
        info!("[acme] created order {url} for {domain}");
        Ok(Box::new(AcmeOrder {
            url,
            inner: Mutex::new(order),
        }))
    }
}

struct AcmeOrder {
    url: String,
    inner: Mutex<Order>,
}

fn order_state(status: &OrderStatus) -> OrderState {
    match status {
        OrderStatus::Pending => OrderState::Pending,
        OrderStatus::Ready => OrderState::Ready,
        OrderStatus::Processing => OrderState::Processing,
        OrderStatus::Valid => OrderState::Valid,
        OrderStatus::Invalid => OrderState::Invalid,
    }
}

fn authorization_state(status: &AuthorizationStatus) -> ValidationState {
    match status {
        AuthorizationStatus::Pending => ValidationState::Pending,
        AuthorizationStatus::Valid => ValidationState::Valid,
        _ => ValidationState::Invalid,
    }
}

#[async_trait]
impl CaOrder for AcmeOrder {
    fn url(&self) -> &str {
        &self.url
    }

    async fn authorizations(&self) -> Result<Vec<AuthorizationView>, CaError> {
        let mut order = self.inner.lock().await;
        let authorizations = order.authorizations().await?;
        let views = authorizations
            .iter()
            .map(|authz| {
                let dns01 = authz
                    .challenges
                    .iter()
                    .find(|challenge| matches!(challenge.r#type, ChallengeType::Dns01))
                    .map(|challenge| DnsChallenge {
                        url: challenge.url.clone(),
                        token: challenge.token.clone(),
                        key_authorization: order.key_authorization(challenge).as_str().to_string(),
                        error: challenge.error.as_ref().map(ToString::to_string),
                    });
                AuthorizationView {
                    status: authorization_state(&authz.status),
                    dns01,
                }
            })
            .collect();
        Ok(views)
    }

    async fn set_challenge_ready(&self, challenge_url: &str) -> Result<(), CaError> {
        self.inner
            .lock()
            .await
            .set_challenge_ready(challenge_url)
            .await?;
        Ok(())
    }

    async fn refresh(&self) -> Result<OrderState, CaError> {
        let mut order = self.inner.lock().await;
        let state = order.refresh().await?;
        Ok(order_state(&state.status))
    }

    async fn finalize(&self, csr_der: &[u8]) -> Result<(), CaError> {
        self.inner.lock().await.finalize(csr_der).await?;
        Ok(())
    }

    async fn certificate(&self) -> Result<Option<String>, CaError> {
        Ok(self.inner.lock().await.certificate().await?)
    }
}
