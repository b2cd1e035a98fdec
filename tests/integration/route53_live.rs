//! Runs against a real Route 53 hosted zone. Needs
//! `CERTPILOT_AWS_ACCESS_KEY_ID`, `CERTPILOT_AWS_SECRET_ACCESS_KEY` and
//! `CERTPILOT_TEST_ROUTE53_DOMAIN` (a name inside a zone the keys can edit).

use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use certpilot::issuance::dns::{public_resolver, wait_for_txt};
use certpilot::issuance::dns_providers::{DnsManagerFactory, DnsRecordManager, Route53Factory};
use certpilot::secrets::{EnvSecretProvider, SecretProvider};

fn test_domain() -> Result<String> {
    std::env::var("CERTPILOT_TEST_ROUTE53_DOMAIN")
        .context("CERTPILOT_TEST_ROUTE53_DOMAIN must be set for Route 53 tests")
}

#[tokio::test]
async fn route53_publish_and_delete_txt() -> Result<()> {
    let domain = test_domain()?;
    let credentials = EnvSecretProvider::new().get_credentials("integration").await?;
    let dns = Route53Factory.manager_for(&credentials).await?;

    let zone = dns.resolve_hosted_zone(&domain).await?;
    let name = format!("_certpilot-it.{domain}");
    let value = format!("integration-{}", uuid::Uuid::new_v4());

    dns.upsert_txt(&zone, &name, &value, 60).await?;
    let resolver = public_resolver(Duration::from_secs(5));
    let visible = wait_for_txt(resolver.as_ref(), &name, &value, 20, Duration::from_secs(15)).await;
    dns.delete_txt(&zone, &name, &value).await?;

    if !visible? {
        return Err(anyhow!("{name} never became visible on public resolvers"));
    }
    Ok(())
}

#[tokio::test]
async fn route53_unknown_zone_is_reported() -> Result<()> {
    let credentials = EnvSecretProvider::new().get_credentials("integration").await?;
    let dns = Route53Factory.manager_for(&credentials).await?;
    let err = dns
        .resolve_hosted_zone("no-such-zone.certpilot.invalid")
        .await
        .err()
        .ok_or_else(|| anyhow!("expected no hosted zone for an .invalid name"))?;
    if !err.to_string().contains("no hosted zone") {
        return Err(anyhow!("unexpected error: {err}"));
    }
    Ok(())
}
