use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::issuance::dns_providers::DnsError;
use crate::issuance::http::{build_client, status_error, transport_error};

const TXT_RECORD_TYPE: u16 = 16;
const DNS_STATUS_NOERROR: u32 = 0;
const DNS_STATUS_FORMERR: u32 = 1;
const DNS_STATUS_NXDOMAIN: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationState {
    Pending,
    Found,
    NxDomain,
    WrongContent,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsPropagationResult {
    pub state: PropagationState,
    pub reason: Option<String>,
    pub observed_values: Vec<String>,
}

/// What public resolvers currently answer for a TXT name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxtAnswer {
    /// Concatenated values of every TXT record seen.
    Records(Vec<String>),
    /// The name exists but carries no TXT record yet.
    NoRecord,
    NxDomain,
}

#[async_trait]
pub trait TxtResolver: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> Result<TxtAnswer, DnsError>;
}

/// A JSON DNS-over-HTTPS endpoint (`application/dns-json`).
#[derive(Debug, Clone)]
pub struct DohEndpoint {
    pub name: String,
    pub url: String,
}

impl DohEndpoint {
    pub fn google() -> Self {
        Self {
            name: "Google DNS".to_string(),
            url: "https://dns.google/resolve".to_string(),
        }
    }

    pub fn cloudflare() -> Self {
        Self {
            name: "Cloudflare DNS".to_string(),
            url: "https://cloudflare-dns.com/dns-query".to_string(),
        }
    }
}

/// Queries several independent public resolvers in parallel so a single
/// resolver's cache cannot produce a false positive or a false negative.
pub struct DohResolver {
    client: Client,
    endpoints: Vec<DohEndpoint>,
}

impl DohResolver {
    pub fn new(client: Client, endpoints: Vec<DohEndpoint>) -> Self {
        Self { client, endpoints }
    }

    pub fn public(timeout: Duration) -> Self {
        Self::new(
            build_client(timeout),
            vec![DohEndpoint::google(), DohEndpoint::cloudflare()],
        )
    }
}

#[async_trait]
impl TxtResolver for DohResolver {
    async fn lookup_txt(&self, name: &str) -> Result<TxtAnswer, DnsError> {
        let mut queries = JoinSet::new();
        for endpoint in &self.endpoints {
            let client = self.client.clone();
            let endpoint = endpoint.clone();
            let name = name.to_string();
            queries.spawn(async move {
                let result = query_endpoint(&client, &endpoint, &name).await;
                (endpoint.name, result)
            });
        }

        let mut responses = Vec::new();
        let mut last_error = None;
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((resolver, Ok(response))) => {
                    debug!(
                        "[dns] {resolver} responded for {name}: status={}, answers={}",
                        response.status,
                        response.answer.as_ref().map_or(0, Vec::len)
                    );
                    responses.push(response);
                }
                Ok((resolver, Err(err))) => {
                    debug!("[dns] {resolver} query failed for {name}: {err}");
                    last_error = Some(err);
                }
                Err(err) => {
                    last_error = Some(DnsError::Transient(format!("resolver task failed: {err}")));
                }
            }
        }

        if responses.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                DnsError::Transient(format!("no DNS resolvers configured for {name}"))
            }));
        }
        merge_responses(name, &responses)
    }
}

async fn query_endpoint(
    client: &Client,
    endpoint: &DohEndpoint,
    name: &str,
) -> Result<DohResponse, DnsError> {
    let response = client
        .get(&endpoint.url)
        .query(&[("name", name), ("type", "TXT")])
        .header(ACCEPT, "application/dns-json")
        .send()
        .await
        .map_err(|err| transport_error(&endpoint.name, &err))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.ok();
        return Err(status_error(&endpoint.name, status, body));
    }
    response
        .json::<DohResponse>()
        .await
        .map_err(|err| transport_error(&endpoint.name, &err))
}

#[derive(Debug, Deserialize, Clone)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: Option<u16>,
    data: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

fn merge_responses(name: &str, responses: &[DohResponse]) -> Result<TxtAnswer, DnsError> {
    let mut observed = Vec::new();
    let mut saw_ok = false;
    let mut saw_nxdomain = false;
    let mut saw_formerr = false;

    for response in responses {
        if let Some(answers) = &response.answer {
            for answer in answers {
                if answer.record_type.is_some_and(|t| t != TXT_RECORD_TYPE) {
                    continue;
                }
                if let Some(data) = &answer.data {
                    let value = concat_txt_segments(data);
                    if !observed.contains(&value) {
                        observed.push(value);
                    }
                }
            }
        }
        match response.status {
            DNS_STATUS_NOERROR => saw_ok = true,
            DNS_STATUS_NXDOMAIN => saw_nxdomain = true,
            DNS_STATUS_FORMERR => saw_formerr = true,
            other => warn!("[dns] unexpected status {other} for {name}"),
        }
    }

    if !observed.is_empty() {
        return Ok(TxtAnswer::Records(observed));
    }
    if saw_ok {
        return Ok(TxtAnswer::NoRecord);
    }
    if saw_nxdomain {
        return Ok(TxtAnswer::NxDomain);
    }
    if saw_formerr {
        return Err(DnsError::MalformedQuery(format!(
            "resolvers rejected the TXT query for {name}"
        )));
    }
    Err(DnsError::Transient(format!(
        "resolvers returned no usable answer for {name}"
    )))
}

/// Joins the quoted character-strings of one TXT record. Some resolvers
/// return `"a" "b"`, others the bare concatenation.
fn concat_txt_segments(data: &str) -> String {
    let trimmed = data.trim();
    if !trimmed.starts_with('"') {
        return trimmed.to_string();
    }

    let mut value = String::with_capacity(trimmed.len());
    let mut in_quotes = false;
    let mut chars = trimmed.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    value.push(escaped);
                }
            }
            c if in_quotes => value.push(c),
            _ => {}
        }
    }
    value
}

/// Compares a resolver answer with the expected digest, byte for byte.
pub fn evaluate_answer(answer: &TxtAnswer, expected: &str) -> DnsPropagationResult {
    match answer {
        TxtAnswer::Records(values) if values.iter().any(|v| v == expected) => {
            DnsPropagationResult {
                state: PropagationState::Found,
                reason: None,
                observed_values: values.clone(),
            }
        }
        TxtAnswer::Records(values) => DnsPropagationResult {
            state: PropagationState::WrongContent,
            reason: Some("TXT record present with different value".to_string()),
            observed_values: values.clone(),
        },
        TxtAnswer::NoRecord => DnsPropagationResult {
            state: PropagationState::Pending,
            reason: Some("record not found yet".to_string()),
            observed_values: Vec::new(),
        },
        TxtAnswer::NxDomain => DnsPropagationResult {
            state: PropagationState::NxDomain,
            reason: Some("record not found (NXDOMAIN)".to_string()),
            observed_values: Vec::new(),
        },
    }
}

/// Polls `resolver` until a TXT record at `name` equals `expected`.
///
/// Makes at most `max_attempts` queries, sleeping `interval` between them.
/// Missing or stale records and transport failures are retried; a
/// malformed query is returned as an error immediately. Running out of
/// attempts yields `Ok(false)` so the caller can choose how to degrade.
pub async fn wait_for_txt(
    resolver: &dyn TxtResolver,
    name: &str,
    expected: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<bool, DnsError> {
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match resolver.lookup_txt(name).await {
            Ok(answer) => {
                let result = evaluate_answer(&answer, expected);
                if result.state == PropagationState::Found {
                    info!("[dns] {name} visible after {attempt} attempt(s)");
                    return Ok(true);
                }
                debug!(
                    "[dns] {name} not visible yet (attempt {attempt}/{max_attempts}, state={:?}, observed={:?})",
                    result.state, result.observed_values
                );
            }
            Err(err @ DnsError::MalformedQuery(_)) => {
                warn!("[dns] giving up on {name}: {err}");
                return Err(err);
            }
            Err(err) => {
                debug!("[dns] lookup of {name} failed (attempt {attempt}/{max_attempts}): {err}");
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    warn!("[dns] {name} still not visible after {max_attempts} attempt(s)");
    Ok(false)
}

/// Convenience wrapper used by the service wiring.
pub fn public_resolver(timeout: Duration) -> Arc<dyn TxtResolver> {
    Arc::new(DohResolver::public(timeout))
}
