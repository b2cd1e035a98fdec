use anyhow::{Result, anyhow};

const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

pub fn normalize_domain_for_storage(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    if trimmed.contains('*') {
        return Err(anyhow!("wildcard domains are not supported: {trimmed}"));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|err| anyhow!("invalid domain name: {err}"))?;
    if ascii.is_empty() || !ascii.contains('.') {
        return Err(anyhow!("domain must be fully qualified: {trimmed}"));
    }
    Ok(ascii.to_lowercase())
}

/// Name of the DNS-01 challenge record for `domain`.
pub fn challenge_record_name(domain: &str) -> String {
    let trimmed = domain.trim_end_matches('.');
    if trimmed.starts_with("_acme-challenge.") {
        trimmed.to_string()
    } else {
        format!("{ACME_CHALLENGE_LABEL}.{trimmed}")
    }
}

/// Returns true when `zone_name` is `domain` or one of its parent zones.
/// Both sides are normalized, so IDN and trailing-dot forms compare equal.
pub fn matches_zone(domain: &str, zone_name: &str) -> bool {
    let domain = match normalize_zone_name(domain) {
        Some(value) => value,
        None => return false,
    };
    let zone_name = match normalize_zone_name(zone_name) {
        Some(value) => value,
        None => return false,
    };
    zone_name == domain || domain.ends_with(&format!(".{}", zone_name))
}

/// Picks the longest zone name that contains `domain`.
pub fn longest_matching_zone<'a, I>(domain: &str, zone_names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    zone_names
        .into_iter()
        .filter(|zone| matches_zone(domain, zone))
        .max_by_key(|zone| zone.trim_end_matches('.').len())
}

// Zones may be single-label TLDs ("test."), so this skips the FQDN check.
fn normalize_zone_name(input: &str) -> Option<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    idna::domain_to_ascii(trimmed)
        .ok()
        .map(|ascii| ascii.to_lowercase())
}
