//! SSRF guard: the single chokepoint between externally-supplied media URLs
//! and anything that stores or fetches them.
//!
//! Rules, applied in order: parseable, https only, host on the allowlist
//! (exact or proper subdomain), DNS resolves, and no resolved address is
//! loopback, private, link-local or unspecified. Resolution failure is
//! fail-closed.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::RwLock;

use url::Url;

/// How the guard resolves hostnames. The static table exists so tests stay
/// hermetic; production always uses the system resolver.
enum Resolver {
    System,
    Static(HashMap<String, Vec<IpAddr>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlRejection {
    Empty,
    Unparseable,
    SchemeNotHttps,
    HostMissing,
    HostNotAllowed,
    DnsLookupFailed,
    PrivateAddress,
}

impl UrlRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlRejection::Empty => "empty",
            UrlRejection::Unparseable => "unparseable",
            UrlRejection::SchemeNotHttps => "scheme_not_https",
            UrlRejection::HostMissing => "host_missing",
            UrlRejection::HostNotAllowed => "host_not_allowed",
            UrlRejection::DnsLookupFailed => "dns_lookup_failed",
            UrlRejection::PrivateAddress => "private_address",
        }
    }
}

impl std::fmt::Display for UrlRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a successful validation: the parsed URL together with the
/// addresses that were actually checked. A fetcher that connects to exactly
/// these addresses cannot be redirected elsewhere by a second resolution.
#[derive(Debug, Clone)]
pub struct VettedUrl {
    pub url: Url,
    pub host: String,
    pub port: u16,
    pub addrs: Vec<IpAddr>,
}

/// Allowlist-backed URL validator. Many concurrent readers, exclusive
/// writers for runtime allowlist edits.
pub struct UrlGuard {
    allowed: RwLock<BTreeSet<String>>,
    resolver: Resolver,
}

impl UrlGuard {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: RwLock::new(Self::normalize(hosts)),
            resolver: Resolver::System,
        }
    }

    /// Guard with a fixed host → address table instead of live DNS.
    pub fn with_static_dns<I, S>(hosts: I, dns: HashMap<String, Vec<IpAddr>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: RwLock::new(Self::normalize(hosts)),
            resolver: Resolver::Static(dns),
        }
    }

    fn normalize<I, S>(hosts: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        hosts
            .into_iter()
            .map(|h| h.into().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect()
    }

    pub fn add_host(&self, host: &str) {
        let host = host.trim().to_ascii_lowercase();
        if !host.is_empty() {
            self.allowed.write().unwrap().insert(host);
        }
    }

    pub fn remove_host(&self, host: &str) {
        let host = host.trim().to_ascii_lowercase();
        self.allowed.write().unwrap().remove(&host);
    }

    pub fn allowed_hosts(&self) -> Vec<String> {
        self.allowed.read().unwrap().iter().cloned().collect()
    }

    /// Exact allowlist match, or a proper subdomain of an entry. The dot
    /// boundary keeps `evil-cdn.example.com` out when `cdn.example.com` is
    /// the entry.
    fn host_allowed(&self, host: &str) -> bool {
        let allowed = self.allowed.read().unwrap();
        allowed
            .iter()
            .any(|entry| host == entry || host.ends_with(&format!(".{entry}")))
    }

    pub async fn validate(&self, raw: &str) -> std::result::Result<(), UrlRejection> {
        self.vet(raw).await.map(|_| ())
    }

    /// Validate and return what was validated. Fetchers pin their
    /// connections to the returned addresses so the address checked and the
    /// address dialed are the same one.
    pub async fn vet(&self, raw: &str) -> std::result::Result<VettedUrl, UrlRejection> {
        if raw.trim().is_empty() {
            return Err(UrlRejection::Empty);
        }
        let parsed = Url::parse(raw).map_err(|_| UrlRejection::Unparseable)?;
        if parsed.scheme() != "https" {
            return Err(UrlRejection::SchemeNotHttps);
        }
        let host = parsed
            .host_str()
            .ok_or(UrlRejection::HostMissing)?
            .to_ascii_lowercase();
        if !self.host_allowed(&host) {
            return Err(UrlRejection::HostNotAllowed);
        }
        let port = parsed.port_or_known_default().unwrap_or(443);
        // Address literals need no resolution.
        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_forbidden_addr(ip) {
                return Err(UrlRejection::PrivateAddress);
            }
            return Ok(VettedUrl {
                url: parsed,
                host,
                port,
                addrs: vec![ip],
            });
        }
        let addrs = self.resolve(&host, port).await?;
        if addrs.is_empty() {
            return Err(UrlRejection::DnsLookupFailed);
        }
        if addrs.iter().any(|ip| is_forbidden_addr(*ip)) {
            return Err(UrlRejection::PrivateAddress);
        }
        Ok(VettedUrl {
            url: parsed,
            host,
            port,
            addrs,
        })
    }

    async fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> std::result::Result<Vec<IpAddr>, UrlRejection> {
        match &self.resolver {
            Resolver::System => {
                let addrs = tokio::net::lookup_host((host, port))
                    .await
                    .map_err(|_| UrlRejection::DnsLookupFailed)?;
                Ok(addrs.map(|a| a.ip()).collect())
            }
            Resolver::Static(table) => {
                table.get(host).cloned().ok_or(UrlRejection::DnsLookupFailed)
            }
        }
    }
}

/// Addresses a validated URL must never resolve to: loopback, RFC1918 / ULA,
/// link-local, unspecified.
fn is_forbidden_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_forbidden_addr(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique-local fc00::/7
                || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn guard() -> UrlGuard {
        UrlGuard::new(["cdn1.suno.ai", "cdn.kie.ai", "cdn.example.com"])
    }

    #[tokio::test]
    async fn test_empty_and_garbage_rejected() {
        let guard = guard();
        assert_eq!(guard.validate("").await.unwrap_err(), UrlRejection::Empty);
        assert_eq!(
            guard.validate("not a url at all").await.unwrap_err(),
            UrlRejection::Unparseable
        );
    }

    #[tokio::test]
    async fn test_non_https_scheme_rejected() {
        let guard = guard();
        assert_eq!(
            guard.validate("http://cdn1.suno.ai/s1.mp3").await.unwrap_err(),
            UrlRejection::SchemeNotHttps
        );
        assert_eq!(
            guard.validate("ftp://cdn1.suno.ai/s1.mp3").await.unwrap_err(),
            UrlRejection::SchemeNotHttps
        );
    }

    #[tokio::test]
    async fn test_off_allowlist_host_rejected() {
        let guard = guard();
        assert_eq!(
            guard
                .validate("https://files.elsewhere.net/s1.mp3")
                .await
                .unwrap_err(),
            UrlRejection::HostNotAllowed
        );
    }

    #[tokio::test]
    async fn test_subdomain_boundary_is_dot() {
        let guard = guard();
        // A proper subdomain passes the host check (and then fails DNS here,
        // which is fine: the policy decision already happened).
        assert!(guard.host_allowed("audio.cdn.example.com"));
        // A lookalike suffix without the dot boundary does not.
        assert!(!guard.host_allowed("evil-cdn.example.com"));
        assert!(!guard.host_allowed("notcdn.example.com"));
    }

    #[tokio::test]
    async fn test_private_literal_rejected_even_when_allowlisted() {
        let guard = UrlGuard::new(["10.0.0.1", "127.0.0.1", "192.168.1.5"]);
        assert_eq!(
            guard.validate("https://10.0.0.1/x.png").await.unwrap_err(),
            UrlRejection::PrivateAddress
        );
        assert_eq!(
            guard.validate("https://127.0.0.1/x.png").await.unwrap_err(),
            UrlRejection::PrivateAddress
        );
        assert_eq!(
            guard
                .validate("https://192.168.1.5/x.png")
                .await
                .unwrap_err(),
            UrlRejection::PrivateAddress
        );
    }

    #[tokio::test]
    async fn test_case_insensitive_host_match() {
        let guard = guard();
        assert!(guard.host_allowed("cdn1.suno.ai"));
        let upper = UrlGuard::new(["CDN1.SUNO.AI"]);
        assert!(upper.host_allowed("cdn1.suno.ai"));
    }

    #[tokio::test]
    async fn test_runtime_allowlist_edits() {
        let guard = guard();
        assert!(!guard.host_allowed("media.tunereel.app"));
        guard.add_host("Media.Tunereel.App");
        assert!(guard.host_allowed("media.tunereel.app"));
        guard.remove_host("media.tunereel.app");
        assert!(!guard.host_allowed("media.tunereel.app"));
    }

    #[tokio::test]
    async fn test_static_resolution_happy_path() {
        let dns = HashMap::from([(
            "cdn1.suno.ai".to_string(),
            vec![IpAddr::V4(Ipv4Addr::new(104, 18, 7, 7))],
        )]);
        let guard = UrlGuard::with_static_dns(["cdn1.suno.ai"], dns);
        guard
            .validate("https://cdn1.suno.ai/s1.mp3")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_vet_returns_checked_addresses() {
        let checked = IpAddr::V4(Ipv4Addr::new(104, 18, 7, 7));
        let dns = HashMap::from([("cdn1.suno.ai".to_string(), vec![checked])]);
        let guard = UrlGuard::with_static_dns(["cdn1.suno.ai"], dns);
        let vetted = guard.vet("https://cdn1.suno.ai:8443/s1.mp3").await.unwrap();
        assert_eq!(vetted.host, "cdn1.suno.ai");
        assert_eq!(vetted.port, 8443);
        assert_eq!(vetted.addrs, vec![checked]);
        assert_eq!(vetted.url.path(), "/s1.mp3");
    }

    #[tokio::test]
    async fn test_vet_of_literal_returns_the_literal() {
        let guard = UrlGuard::new(["104.18.7.7"]);
        let vetted = guard.vet("https://104.18.7.7/x.png").await.unwrap();
        assert_eq!(vetted.port, 443);
        assert_eq!(vetted.addrs, vec!["104.18.7.7".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_rebound_host_rejected() {
        // Allowlisted name resolving into private space still fails.
        let dns = HashMap::from([(
            "cdn1.suno.ai".to_string(),
            vec![
                IpAddr::V4(Ipv4Addr::new(104, 18, 7, 7)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)),
            ],
        )]);
        let guard = UrlGuard::with_static_dns(["cdn1.suno.ai"], dns);
        assert_eq!(
            guard
                .validate("https://cdn1.suno.ai/s1.mp3")
                .await
                .unwrap_err(),
            UrlRejection::PrivateAddress
        );
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails_closed() {
        let guard = UrlGuard::with_static_dns(["cdn1.suno.ai"], HashMap::new());
        assert_eq!(
            guard
                .validate("https://cdn1.suno.ai/s1.mp3")
                .await
                .unwrap_err(),
            UrlRejection::DnsLookupFailed
        );
    }

    #[test]
    fn test_forbidden_address_classes() {
        assert!(is_forbidden_addr(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_forbidden_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_forbidden_addr(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_forbidden_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
        assert!(is_forbidden_addr(IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1))));
        assert!(is_forbidden_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert!(is_forbidden_addr(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        // Unique-local and link-local v6.
        assert!(is_forbidden_addr("fd12:3456::1".parse().unwrap()));
        assert!(is_forbidden_addr("fe80::1".parse().unwrap()));
        // Mapped v4 private.
        assert!(is_forbidden_addr("::ffff:10.0.0.1".parse().unwrap()));
        // Public addresses pass.
        assert!(!is_forbidden_addr(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
        assert!(!is_forbidden_addr("2606:4700::1111".parse().unwrap()));
    }
}
