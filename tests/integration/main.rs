mod issuance;
mod test_utils;

#[cfg(feature = "integration-tests")]
mod route53_live;
