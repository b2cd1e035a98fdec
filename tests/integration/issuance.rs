use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;

use certpilot::config::PropagationPolicy;
use certpilot::core::types::{CancelOutcome, DeleteOutcome, ErrorCode, RenewalStatus};
use certpilot::issuance::dns_providers::DnsRecordManager;
use certpilot::storage::ChallengeBookkeeping;
use certpilot::{IssuanceError, RequestStatus};

use super::test_utils::{
    CONTACT, CaBehavior, EXPECTED_DIGEST, Harness, HarnessOptions, TENANT, TOKEN, fast_policy,
};

fn harness_with(behavior: CaBehavior) -> Result<Harness> {
    Harness::new(HarnessOptions {
        behavior,
        ..HarnessOptions::default()
    })
}

async fn issue(harness: &Harness, domain: &str) -> Result<certpilot::CertificateRequest> {
    let request = harness.service.submit(TENANT, domain, CONTACT).await?;
    harness.settle(&request.id).await
}

fn assert_failed_with(request: &certpilot::CertificateRequest, code: ErrorCode) {
    assert_eq!(request.status, RequestStatus::Error, "request: {request:?}");
    assert_eq!(request.error_code, Some(code));
    let message = request.error_message.as_deref().unwrap_or_default();
    assert!(
        message.starts_with(&format!("{code}: ")),
        "unexpected error message {message:?}"
    );
}

#[tokio::test]
async fn issues_certificate_and_cleans_up_challenge() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;

    let submitted = harness.service.submit(TENANT, "Example.TEST.", CONTACT).await?;
    assert_eq!(submitted.status, RequestStatus::Pending);
    assert_eq!(submitted.domain, "example.test");

    let done = harness.settle(&submitted.id).await?;
    assert_eq!(done.status, RequestStatus::Issued, "request: {done:?}");
    assert_eq!(done.challenge_token.as_deref(), Some(TOKEN));
    assert_eq!(done.expected_digest.as_deref(), Some(EXPECTED_DIGEST));
    assert_eq!(done.challenge_record.as_deref(), Some("_acme-challenge.example.test"));
    assert_eq!(done.zone_name.as_deref(), Some("test"));
    assert!(done.order_handle.is_some());
    assert!(done.error_code.is_none());
    assert_eq!(done.fingerprint.as_deref().map(str::len), Some(64));

    let issued = done.issue_date.ok_or_else(|| anyhow!("missing issue date"))?;
    let expiry = done.expiry_date.ok_or_else(|| anyhow!("missing expiry date"))?;
    assert_eq!((expiry - issued).num_days(), 90);

    let paths = done.paths().ok_or_else(|| anyhow!("missing certificate paths"))?;
    for path in [&paths.cert_path, &paths.key_path, &paths.chain_path] {
        assert!(Path::new(path).exists(), "{path} was not written");
    }
    let key_mode = std::fs::metadata(&paths.key_path)?.permissions().mode() & 0o777;
    assert_eq!(key_mode, 0o600);
    let chain = std::fs::read_to_string(&paths.chain_path)?;
    assert_eq!(pem::parse_many(chain)?.len(), 2);

    assert_eq!(harness.dns.upsert_calls(), 1);
    assert!(harness.dns.records().is_empty(), "challenge record left behind");
    assert_eq!(harness.ca.notified(), 1);
    assert_eq!(harness.ca.finalized(), 1);
    Ok(())
}

#[tokio::test]
async fn rejected_challenge_fails_and_removes_record() -> Result<()> {
    let harness = harness_with(CaBehavior::Invalid)?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::ValidationFailed);
    assert!(
        done.error_message
            .as_deref()
            .is_some_and(|message| message.contains("unauthorized"))
    );
    assert!(done.cert_path.is_none());
    assert!(harness.dns.records().is_empty());
    assert!(harness.dns.delete_calls() >= 1);
    assert_eq!(harness.ca.finalized(), 0);
    Ok(())
}

#[tokio::test]
async fn missing_hosted_zone_fails_before_ordering() -> Result<()> {
    let harness = Harness::new(HarnessOptions {
        zones: vec!["example.org."],
        ..HarnessOptions::default()
    })?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::ZoneNotFound);
    assert_eq!(harness.dns.upsert_calls(), 0);
    assert_eq!(harness.ca.orders(), 0);
    Ok(())
}

#[tokio::test]
async fn missing_dns01_challenge_is_reported() -> Result<()> {
    let harness = harness_with(CaBehavior::NoDns01)?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::ChallengeUnavailable);
    assert_eq!(harness.dns.upsert_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn valid_authorization_skips_dns_challenge() -> Result<()> {
    let harness = harness_with(CaBehavior::AlreadyValid)?;
    let done = issue(&harness, "example.test").await?;

    assert_eq!(done.status, RequestStatus::Issued, "request: {done:?}");
    assert!(done.expected_digest.is_none());
    assert_eq!(harness.dns.upsert_calls(), 0);
    assert_eq!(harness.ca.notified(), 0);
    Ok(())
}

#[tokio::test]
async fn unpropagated_record_fails_under_fail_policy() -> Result<()> {
    let mut policy = fast_policy();
    policy.propagation_policy = PropagationPolicy::Fail;
    let harness = Harness::new(HarnessOptions {
        resolver_sees_records: false,
        policy,
        ..HarnessOptions::default()
    })?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::PropagationTimeout);
    assert_eq!(harness.ca.notified(), 0);
    assert!(harness.dns.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn unpropagated_record_still_notifies_under_proceed_policy() -> Result<()> {
    let harness = Harness::new(HarnessOptions {
        resolver_sees_records: false,
        ..HarnessOptions::default()
    })?;
    let done = issue(&harness, "example.test").await?;

    assert_eq!(done.status, RequestStatus::Issued, "request: {done:?}");
    assert_eq!(harness.ca.notified(), 1);
    Ok(())
}

#[tokio::test]
async fn stalled_validation_times_out() -> Result<()> {
    let mut policy = fast_policy();
    policy.validation_timeout = Duration::from_millis(100);
    let harness = Harness::new(HarnessOptions {
        behavior: CaBehavior::NeverReady,
        policy,
        ..HarnessOptions::default()
    })?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::ValidationFailed);
    assert!(harness.dns.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn one_issuance_per_domain_at_a_time() -> Result<()> {
    let harness = harness_with(CaBehavior::NeverReady)?;
    let first = harness.service.submit(TENANT, "example.test", CONTACT).await?;

    let second = harness.service.submit(TENANT, "EXAMPLE.test", CONTACT).await;
    assert!(matches!(second, Err(IssuanceError::AlreadyInProgress(_))));
    assert_eq!(harness.service.list(TENANT)?.len(), 1);

    assert_eq!(harness.service.cancel(&first.id), CancelOutcome::Cancelled);
    let done = harness.settle(&first.id).await?;
    assert_failed_with(&done, ErrorCode::Cancelled);

    let retry = harness.service.submit(TENANT, "example.test", CONTACT).await?;
    assert_ne!(retry.id, first.id);
    harness.service.cancel(&retry.id);
    harness.settle(&retry.id).await?;
    Ok(())
}

#[tokio::test]
async fn different_domains_issue_concurrently_with_one_account() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    let a = harness.service.submit(TENANT, "a.example.test", CONTACT).await?;
    let b = harness.service.submit(TENANT, "b.example.test", CONTACT).await?;

    let (a, b) = tokio::try_join!(harness.settle(&a.id), harness.settle(&b.id))?;
    assert_eq!(a.status, RequestStatus::Issued, "request: {a:?}");
    assert_eq!(b.status, RequestStatus::Issued, "request: {b:?}");
    assert_ne!(a.cert_path, b.cert_path);
    assert_eq!(harness.ca.accounts(), vec![CONTACT.to_string()]);
    assert_eq!(harness.ca.orders(), 2);
    assert!(harness.dns.records().is_empty());

    let listed = harness.service.list(TENANT)?;
    assert_eq!(listed.len(), 2);
    assert!(harness.service.list("someone-else")?.is_empty());
    Ok(())
}

#[tokio::test]
async fn cancel_during_validation_removes_challenge() -> Result<()> {
    let harness = harness_with(CaBehavior::NeverReady)?;
    let request = harness.service.submit(TENANT, "example.test", CONTACT).await?;

    harness
        .wait_for_status(&request.id, RequestStatus::AwaitingCaValidation)
        .await?;
    assert!(harness.service.is_running(&request.id));
    assert_eq!(harness.service.cancel(&request.id), CancelOutcome::Cancelled);

    let done = harness.settle(&request.id).await?;
    assert_failed_with(&done, ErrorCode::Cancelled);
    assert!(harness.dns.records().is_empty());
    assert_eq!(harness.ca.finalized(), 0);
    assert_eq!(harness.service.cancel(&request.id), CancelOutcome::NotRunning);
    Ok(())
}

#[tokio::test]
async fn cancel_of_unknown_request_is_not_running() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    assert_eq!(harness.service.cancel("no-such-request"), CancelOutcome::NotRunning);
    Ok(())
}

#[tokio::test]
async fn rejects_bad_input_without_creating_a_request() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;

    let wildcard = harness.service.submit(TENANT, "*.example.test", CONTACT).await;
    assert!(matches!(wildcard, Err(IssuanceError::InvalidDomain(_))));
    let unqualified = harness.service.submit(TENANT, "localhost", CONTACT).await;
    assert!(matches!(unqualified, Err(IssuanceError::InvalidDomain(_))));

    let unknown = harness.service.submit("tenant-b", "example.test", CONTACT).await;
    match unknown {
        Err(err @ IssuanceError::CredentialsNotFound(_)) => {
            assert_eq!(err.code(), ErrorCode::CredentialsNotFound);
        }
        other => panic!("expected CredentialsNotFound, got {other:?}"),
    }

    assert!(harness.service.list(TENANT)?.is_empty());
    assert!(harness.service.list("tenant-b")?.is_empty());
    assert_eq!(harness.ca.orders(), 0);
    Ok(())
}

#[tokio::test]
async fn installs_issued_certificate() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    let issued = issue(&harness, "example.test").await?;

    let report = harness
        .service
        .install(&issued.id, &["nginx".to_string(), "haproxy".to_string()])
        .await?;
    assert!(report.installed);
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    assert_eq!(report.request.status, RequestStatus::Installed);
    assert!(report.request.install_date.is_some());
    for target in ["nginx", "haproxy"] {
        assert!(harness.install_root.join(target).join("fullchain.pem").exists());
        assert!(harness.install_root.join(target).join("privkey.pem").exists());
    }

    // Installed is not issued; a second install is refused.
    assert!(harness.service.install(&issued.id, &["nginx".to_string()]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn failed_install_keeps_request_issued() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    let issued = issue(&harness, "example.test").await?;

    let report = harness
        .service
        .install(&issued.id, &["nginx".to_string(), "../escape".to_string()])
        .await?;
    assert!(!report.installed);
    assert_eq!(report.request.status, RequestStatus::Issued);
    assert!(report.warnings.iter().any(|warning| warning.starts_with("../escape")));
    assert_eq!(report.request.install_warnings, report.warnings);
    Ok(())
}

#[tokio::test]
async fn install_requires_an_issued_certificate() -> Result<()> {
    let harness = harness_with(CaBehavior::Invalid)?;
    let failed = issue(&harness, "example.test").await?;
    assert!(harness.service.install(&failed.id, &["nginx".to_string()]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn expires_certificates_past_their_expiry_date() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    let issued = issue(&harness, "example.test").await?;

    assert!(harness.service.expire_due(Utc::now())?.is_empty());

    let expired = harness
        .service
        .expire_due(Utc::now() + chrono::Duration::days(91))?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, issued.id);
    assert_eq!(expired[0].status, RequestStatus::Expired);
    assert!(harness.service.expire_due(Utc::now() + chrono::Duration::days(91))?.is_empty());
    Ok(())
}

#[tokio::test]
async fn recovers_requests_left_in_flight() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;

    // Simulate a process that published a challenge and then died.
    let stale = harness.requests.create(TENANT, "stale.example.test", CONTACT)?;
    let zone = harness.dns.resolve_hosted_zone("stale.example.test").await?;
    let record_name = "_acme-challenge.stale.example.test";
    harness.requests.record_challenge(&stale.id, &ChallengeBookkeeping {
        token: TOKEN.to_string(),
        digest: EXPECTED_DIGEST.to_string(),
        zone_id: zone.id.clone(),
        zone_name: zone.name.clone(),
        record_name: record_name.to_string(),
    })?;
    harness
        .dns
        .upsert_txt(&zone, record_name, EXPECTED_DIGEST, 60)
        .await?;
    harness
        .requests
        .transition(&stale.id, RequestStatus::AwaitingPropagation)?;

    let recovered = harness.service.recover_interrupted().await?;
    assert_eq!(recovered.len(), 1);
    assert_failed_with(&recovered[0], ErrorCode::Interrupted);
    assert!(harness.dns.records().is_empty());

    // The domain is free again.
    let fresh = issue(&harness, "stale.example.test").await?;
    assert_eq!(fresh.status, RequestStatus::Issued, "request: {fresh:?}");
    assert!(harness.service.recover_interrupted().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn finalize_rejection_is_reported_and_cleans_up() -> Result<()> {
    let harness = harness_with(CaBehavior::FinalizeRejected)?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::FinalizeFailed);
    assert!(done.error_message.as_deref().unwrap_or_default().contains("badCSR"));
    assert!(harness.dns.records().is_empty());
    assert_eq!(harness.ca.notified(), 1);
    assert_eq!(harness.ca.finalized(), 0);
    assert!(done.cert_path.is_none());
    assert!(!harness.cert_root.join("example.test").exists());
    Ok(())
}

#[tokio::test]
async fn chain_that_never_arrives_fails_finalization() -> Result<()> {
    let mut policy = fast_policy();
    policy.certificate_timeout = Duration::from_millis(100);
    let harness = Harness::new(HarnessOptions {
        behavior: CaBehavior::ChainNeverReady,
        policy,
        ..HarnessOptions::default()
    })?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::FinalizeFailed);
    assert!(
        done.error_message
            .as_deref()
            .unwrap_or_default()
            .contains("certificate not available")
    );
    assert_eq!(harness.ca.finalized(), 1);
    assert!(harness.dns.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn unwritable_certificate_directory_is_a_persistence_failure() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    std::fs::create_dir_all(&harness.cert_root)?;
    std::fs::write(harness.cert_root.join("example.test"), "not a directory")?;

    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::PersistenceFailed);
    let message = done.error_message.as_deref().unwrap_or_default();
    assert!(message.contains("re-fetch it from order https://ca.test/order/1"), "{message}");
    assert_eq!(harness.ca.finalized(), 1);
    assert!(done.cert_path.is_none());
    assert!(harness.dns.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn dns_outage_beyond_retry_budget_fails_publication() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    harness.dns.fail_next_upserts(10);

    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::DnsPublishFailed);
    assert!(done.error_message.as_deref().unwrap_or_default().contains("HTTP 503"));
    assert_eq!(harness.dns.upsert_calls(), fast_policy().retry.max_attempts as usize);
    assert!(harness.dns.records().is_empty());
    assert_eq!(harness.ca.notified(), 0);
    Ok(())
}

#[tokio::test]
async fn transient_dns_failure_is_retried() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    harness.dns.fail_next_upserts(1);

    let done = issue(&harness, "example.test").await?;

    assert_eq!(done.status, RequestStatus::Issued, "request: {done:?}");
    assert_eq!(harness.dns.upsert_calls(), 2);
    assert!(harness.dns.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn ca_outage_beyond_retry_budget_is_authority_unavailable() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    harness.ca.fail_next_orders(10);

    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::AuthorityUnavailable);
    assert!(done.order_handle.is_none());
    assert_eq!(harness.ca.order_attempts(), fast_policy().retry.max_attempts as usize);
    assert_eq!(harness.ca.orders(), 0);
    assert_eq!(harness.dns.upsert_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn transient_order_failure_is_retried() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    harness.ca.fail_next_orders(1);

    let done = issue(&harness, "example.test").await?;

    assert_eq!(done.status, RequestStatus::Issued, "request: {done:?}");
    assert_eq!(harness.ca.order_attempts(), 2);
    assert_eq!(harness.ca.orders(), 1);
    Ok(())
}

#[tokio::test]
async fn crashed_issuance_task_fails_request_and_frees_domain() -> Result<()> {
    let harness = harness_with(CaBehavior::PanicOnFinalize)?;
    let done = issue(&harness, "example.test").await?;

    assert_failed_with(&done, ErrorCode::Interrupted);
    assert!(!harness.service.is_running(&done.id));
    assert!(harness.dns.records().is_empty(), "challenge record left behind");
    assert_eq!(harness.service.cancel(&done.id), CancelOutcome::NotRunning);

    let retry = harness.service.submit(TENANT, "example.test", CONTACT).await?;
    assert_ne!(retry.id, done.id);
    let retried = harness.settle(&retry.id).await?;
    assert_failed_with(&retried, ErrorCode::Interrupted);
    Ok(())
}

#[tokio::test]
async fn delete_cancels_running_request_and_removes_it() -> Result<()> {
    let harness = harness_with(CaBehavior::NeverReady)?;
    let request = harness.service.submit(TENANT, "example.test", CONTACT).await?;
    harness
        .wait_for_status(&request.id, RequestStatus::AwaitingCaValidation)
        .await?;

    assert_eq!(harness.service.delete(&request.id).await?, DeleteOutcome::Deleted);
    assert!(harness.service.status(&request.id)?.is_none());
    assert!(!harness.service.is_running(&request.id));
    assert!(harness.dns.records().is_empty());
    assert_eq!(harness.ca.finalized(), 0);
    assert_eq!(harness.service.delete(&request.id).await?, DeleteOutcome::NotFound);

    let retry = harness.service.submit(TENANT, "example.test", CONTACT).await?;
    harness.service.cancel(&retry.id);
    harness.settle(&retry.id).await?;
    Ok(())
}

#[tokio::test]
async fn delete_waits_out_finalization() -> Result<()> {
    let harness = harness_with(CaBehavior::ChainNeverReady)?;
    let request = harness.service.submit(TENANT, "example.test", CONTACT).await?;
    harness
        .wait_for_status(&request.id, RequestStatus::Finalizing)
        .await?;

    assert_eq!(harness.service.delete(&request.id).await?, DeleteOutcome::Deferred);
    assert!(harness.service.status(&request.id)?.is_some());

    let done = harness.settle(&request.id).await?;
    assert_failed_with(&done, ErrorCode::FinalizeFailed);
    assert_eq!(harness.service.delete(&request.id).await?, DeleteOutcome::Deleted);
    assert!(harness.service.list(TENANT)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_of_orphaned_request_removes_its_challenge() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    let stale = harness.requests.create(TENANT, "stale.example.test", CONTACT)?;
    let zone = harness.dns.resolve_hosted_zone("stale.example.test").await?;
    let record_name = "_acme-challenge.stale.example.test";
    harness.requests.record_challenge(&stale.id, &ChallengeBookkeeping {
        token: TOKEN.to_string(),
        digest: EXPECTED_DIGEST.to_string(),
        zone_id: zone.id.clone(),
        zone_name: zone.name.clone(),
        record_name: record_name.to_string(),
    })?;
    harness
        .dns
        .upsert_txt(&zone, record_name, EXPECTED_DIGEST, 60)
        .await?;

    assert_eq!(harness.service.delete(&stale.id).await?, DeleteOutcome::Deleted);
    assert!(harness.dns.records().is_empty());
    assert!(harness.requests.find_active("stale.example.test")?.is_none());
    Ok(())
}

#[tokio::test]
async fn renews_certificates_inside_the_window() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    let original = issue(&harness, "example.test").await?;
    assert_eq!(original.renewal_status, RenewalStatus::NotScheduled);

    let window = chrono::Duration::days(30);
    assert!(harness.service.renewal_due(Utc::now(), window)?.is_empty());

    let later = Utc::now() + chrono::Duration::days(70);
    let scheduled = harness.service.schedule_renewals(later, window)?;
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].id, original.id);
    assert_eq!(scheduled[0].renewal_status, RenewalStatus::Scheduled);
    assert_eq!(scheduled[0].status, RequestStatus::Issued);

    let renewal = harness.service.renew(&original.id).await?;
    assert_ne!(renewal.id, original.id);
    assert_eq!(
        harness.requests.require(&original.id)?.renewal_status,
        RenewalStatus::InProgress
    );
    let renewed = harness.settle(&renewal.id).await?;
    assert_eq!(renewed.status, RequestStatus::Issued, "request: {renewed:?}");
    assert_eq!(
        harness.requests.require(&original.id)?.renewal_status,
        RenewalStatus::NotScheduled
    );

    let due: Vec<String> = harness
        .service
        .renewal_due(later, window)?
        .into_iter()
        .map(|request| request.id)
        .collect();
    assert_eq!(due, vec![renewed.id]);
    Ok(())
}

#[tokio::test]
async fn failed_renewal_is_recorded_and_stays_due() -> Result<()> {
    let harness = harness_with(CaBehavior::Valid)?;
    let original = issue(&harness, "example.test").await?;
    harness.ca.fail_next_orders(10);

    let renewal = harness.service.renew(&original.id).await?;
    let failed = harness.settle(&renewal.id).await?;
    assert_failed_with(&failed, ErrorCode::AuthorityUnavailable);

    let original = harness.requests.require(&original.id)?;
    assert_eq!(original.renewal_status, RenewalStatus::Failed);
    assert_eq!(original.status, RequestStatus::Issued);
    let later = Utc::now() + chrono::Duration::days(70);
    let due = harness.service.renewal_due(later, chrono::Duration::days(30))?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, original.id);
    Ok(())
}

#[tokio::test]
async fn renew_requires_an_issued_certificate() -> Result<()> {
    let harness = harness_with(CaBehavior::Invalid)?;
    let failed = issue(&harness, "example.test").await?;
    assert!(harness.service.renew(&failed.id).await.is_err());
    assert!(harness.service.renew("no-such-request").await.is_err());
    assert_eq!(harness.service.list(TENANT)?.len(), 1);
    Ok(())
}
