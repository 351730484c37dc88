// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan reference URI allow-listing.
//!
//! Runs before any byte is fetched:
//! - a fixed set of dangerous schemes is always denied
//! - `http(s)` URIs need an allow-listed scheme and host, carry no credentials,
//!   and may not point at loopback, link-local or cloud-metadata hosts
//! - any other (object-storage style) scheme must be allow-listed and, when
//!   prefixes are configured, match one of them; dot segments are rejected

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::warn;
use url::{Host, Url};

use crate::error::{CoreError, Result};

/// Schemes rejected regardless of configuration.
pub const DENIED_SCHEMES: &[&str] = &[
    "file",
    "data",
    "javascript",
    "vbscript",
    "ftp",
    "gopher",
    "jar",
    "blob",
];

const METADATA_HOSTS: &[&str] = &["metadata.google.internal", "metadata", "instance-data"];

/// AWS IMDS over IPv6.
const AWS_IMDS_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254);

/// URI allow-list for plan references.
#[derive(Debug, Clone, Default)]
pub struct PlanRefPolicy {
    allowed_schemes: BTreeSet<String>,
    allowed_hosts: Vec<String>,
    allowed_prefixes: Vec<String>,
}

impl PlanRefPolicy {
    /// Policy allowing the given schemes, with no hosts or prefixes yet.
    pub fn new<I, S>(allowed_schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_schemes: allowed_schemes
                .into_iter()
                .map(|s| s.as_ref().trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            allowed_hosts: Vec::new(),
            allowed_prefixes: Vec::new(),
        }
    }

    /// Allow `http(s)` hosts. `*.example.com` matches any subdomain.
    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_hosts = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        self
    }

    /// Require opaque-scheme URIs to start with one of these prefixes.
    pub fn with_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_prefixes = prefixes
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// Reject `uri` with `PLAN_URI_NOT_ALLOWED` unless the policy allows it.
    pub fn validate_or_throw(&self, uri: &str) -> Result<()> {
        let result = self.check(uri);
        if let Err(e) = &result {
            warn!(uri = %uri, code = e.error_code(), error = %e, "Plan URI rejected");
        }
        result
    }

    fn check(&self, uri: &str) -> Result<()> {
        let deny = |reason: String| CoreError::PlanUriNotAllowed {
            uri: uri.to_string(),
            reason,
        };

        let url = Url::parse(uri.trim()).map_err(|e| deny(format!("malformed URI: {}", e)))?;
        let scheme = url.scheme();

        if DENIED_SCHEMES.contains(&scheme) {
            return Err(deny(format!("scheme '{}' is denied", scheme)));
        }
        if !self.allowed_schemes.contains(scheme) {
            return Err(deny(format!("scheme '{}' is not allow-listed", scheme)));
        }

        if scheme == "http" || scheme == "https" {
            if !url.username().is_empty() || url.password().is_some() {
                return Err(deny("credentials in URI are not allowed".to_string()));
            }
            let host = url
                .host()
                .ok_or_else(|| deny("missing host".to_string()))?;
            if let Some(reason) = blocked_host(&host) {
                return Err(deny(reason));
            }
            let host = host.to_string().trim_end_matches('.').to_ascii_lowercase();
            if !self.host_allowed(&host) {
                return Err(deny(format!("host '{}' is not allow-listed", host)));
            }
            return Ok(());
        }

        if has_dot_segment(uri) {
            return Err(deny("dot segments are not allowed".to_string()));
        }
        if !self.allowed_prefixes.is_empty()
            && !self
                .allowed_prefixes
                .iter()
                .any(|prefix| url.as_str().starts_with(prefix.as_str()))
        {
            return Err(deny("URI does not match an allow-listed prefix".to_string()));
        }
        Ok(())
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            match allowed.strip_prefix("*.") {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.')),
                None => host == allowed,
            }
        })
    }
}

fn has_dot_segment(uri: &str) -> bool {
    uri.split(['/', '\\']).any(|segment| {
        let segment = segment.to_ascii_lowercase();
        matches!(segment.as_str(), ".." | "%2e%2e" | ".%2e" | "%2e.")
    })
}

fn blocked_host(host: &Host<&str>) -> Option<String> {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Some(format!("host '{}' is a loopback name", domain));
            }
            if METADATA_HOSTS.contains(&domain.as_str()) {
                return Some(format!("host '{}' is a cloud metadata endpoint", domain));
            }
            None
        }
        Host::Ipv4(ip) => blocked_ipv4(*ip),
        Host::Ipv6(ip) => blocked_ipv6(*ip),
    }
}

fn blocked_ipv4(ip: Ipv4Addr) -> Option<String> {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_broadcast() {
        return Some(format!("address {} is loopback or unspecified", ip));
    }
    if ip.is_link_local() {
        return Some(format!("address {} is link-local (metadata range)", ip));
    }
    None
}

fn blocked_ipv6(ip: Ipv6Addr) -> Option<String> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return blocked_ipv4(v4);
    }
    if ip.is_loopback() || ip.is_unspecified() {
        return Some(format!("address {} is loopback or unspecified", ip));
    }
    if ip.segments()[0] & 0xffc0 == 0xfe80 {
        return Some(format!("address {} is link-local", ip));
    }
    if ip == AWS_IMDS_V6 {
        return Some(format!("address {} is a cloud metadata endpoint", ip));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PlanRefPolicy {
        PlanRefPolicy::new(["https", "http", "s3", "gs"])
            .with_hosts(["plans.example.com", "*.cdn.example.net"])
            .with_prefixes(["s3://plans-bucket/", "gs://plans/"])
    }

    fn code(uri: &str) -> Option<&'static str> {
        policy().validate_or_throw(uri).err().map(|e| e.error_code())
    }

    #[test]
    fn test_allowed_uris() {
        for uri in [
            "https://plans.example.com/p/1.json",
            "https://eu.cdn.example.net/p.json",
            "https://a.b.cdn.example.net/p.json",
            "s3://plans-bucket/tenant-a/p.json",
            "gs://plans/p.json",
        ] {
            assert_eq!(code(uri), None, "{}", uri);
        }
    }

    #[test]
    fn test_denied_schemes() {
        for uri in [
            "file:///etc/passwd",
            "data:application/json,{}",
            "javascript:alert(1)",
            "ftp://plans.example.com/p.json",
            "gopher://plans.example.com/",
            "jar:https://plans.example.com/x!/y",
        ] {
            assert_eq!(code(uri), Some("PLAN_URI_NOT_ALLOWED"), "{}", uri);
        }
        // Denied even when a caller lists it.
        let permissive = PlanRefPolicy::new(["file"]);
        assert!(permissive.validate_or_throw("file:///tmp/p.json").is_err());
    }

    #[test]
    fn test_scheme_must_be_allow_listed() {
        assert_eq!(code("azure://container/p.json"), Some("PLAN_URI_NOT_ALLOWED"));
        let https_only = PlanRefPolicy::new(["https"]).with_hosts(["plans.example.com"]);
        assert!(https_only.validate_or_throw("http://plans.example.com/p.json").is_err());
    }

    #[test]
    fn test_http_host_rules() {
        for uri in [
            "https://evil.example.org/p.json",
            "https://cdn.example.net/p.json",
            "https://notcdn.example.net/p.json",
            "https://plans.example.com.evil.org/p.json",
            "https://user:pw@plans.example.com/p.json",
        ] {
            assert_eq!(code(uri), Some("PLAN_URI_NOT_ALLOWED"), "{}", uri);
        }
    }

    #[test]
    fn test_internal_hosts_blocked_even_if_listed() {
        let policy = PlanRefPolicy::new(["http", "https"]).with_hosts([
            "localhost",
            "127.0.0.1",
            "169.254.169.254",
            "metadata.google.internal",
            "[::1]",
            "[fe80::1]",
            "[fd00:ec2::254]",
            "[::ffff:127.0.0.1]",
            "0.0.0.0",
        ]);
        for uri in [
            "http://localhost/p.json",
            "http://api.localhost/p.json",
            "http://127.0.0.1/p.json",
            "http://169.254.169.254/latest/meta-data/",
            "http://metadata.google.internal/computeMetadata/v1/",
            "http://[::1]/p.json",
            "http://[fe80::1]/p.json",
            "http://[fd00:ec2::254]/latest/",
            "http://[::ffff:127.0.0.1]/p.json",
            "http://0.0.0.0/p.json",
        ] {
            let err = policy.validate_or_throw(uri).unwrap_err();
            assert_eq!(err.error_code(), "PLAN_URI_NOT_ALLOWED", "{}", uri);
        }
    }

    #[test]
    fn test_opaque_prefix_rules() {
        assert_eq!(code("s3://other-bucket/p.json"), Some("PLAN_URI_NOT_ALLOWED"));
        assert_eq!(
            code("s3://plans-bucket/tenant-a/../../secrets/p.json"),
            Some("PLAN_URI_NOT_ALLOWED")
        );
        assert_eq!(
            code("gs://plans/%2E%2E/secrets.json"),
            Some("PLAN_URI_NOT_ALLOWED")
        );

        let no_prefixes = PlanRefPolicy::new(["s3"]);
        assert!(no_prefixes.validate_or_throw("s3://any-bucket/p.json").is_ok());
    }

    #[test]
    fn test_malformed_uri() {
        assert_eq!(code("not a uri"), Some("PLAN_URI_NOT_ALLOWED"));
        assert_eq!(code(""), Some("PLAN_URI_NOT_ALLOWED"));
    }
}
