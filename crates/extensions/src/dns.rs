//! Selection of the DNS provider responsible for a shoot's domain.

use serde::{Deserialize, Serialize};

/// Domains a provider manages, and those it must not touch.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DnsIncludeExclude {
    /// Managed domains.
    #[serde(default)]
    pub include: Vec<String>,
    /// Excluded subdomains.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A configured DNS provider.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsProvider {
    /// Provider type, e.g. `aws-route53`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Secret holding the provider's credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Domains of the provider.
    #[serde(default)]
    pub domains: DnsIncludeExclude,
}

/// The provider chosen for a domain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DnsSelection {
    /// Provider type.
    pub provider: String,
    /// The domain that is served.
    pub domain: String,
}

/// Whether `domain` is `zone` or one of its subdomains. Matching is per
/// label: `aexample.com` is not below `example.com`.
pub fn is_subdomain(domain: &str, zone: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();
    if zone.is_empty() {
        return false;
    }
    domain == zone || domain.ends_with(&format!(".{}", zone))
}

/// Picks the provider whose included domain is the longest match for
/// `domain`. Providers excluding the domain are skipped. Returns `None` if
/// no provider manages the domain.
pub fn select_provider(providers: &[DnsProvider], domain: &str) -> Option<DnsSelection> {
    let mut best: Option<(usize, &DnsProvider)> = None;
    for provider in providers {
        if provider
            .domains
            .exclude
            .iter()
            .any(|excluded| is_subdomain(domain, excluded))
        {
            continue;
        }
        let longest = provider
            .domains
            .include
            .iter()
            .filter(|included| is_subdomain(domain, included))
            .map(|included| included.trim_end_matches('.').len())
            .max();
        if let Some(length) = longest {
            if best.map_or(true, |(current, _)| length > current) {
                best = Some((length, provider));
            }
        }
    }
    best.map(|(_, provider)| DnsSelection {
        provider: provider.type_.clone(),
        domain: domain.trim_end_matches('.').to_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn provider(type_: &str, include: &[&str], exclude: &[&str]) -> DnsProvider {
        DnsProvider {
            type_: type_.to_owned(),
            secret_name: None,
            domains: DnsIncludeExclude {
                include: include.iter().map(|d| d.to_string()).collect(),
                exclude: exclude.iter().map(|d| d.to_string()).collect(),
            },
        }
    }

    #[test]
    fn subdomains_match_on_label_boundaries() {
        let providers = vec![provider("route53", &["example.com"], &[])];
        assert_eq!(
            select_provider(&providers, "shoot.project.example.com"),
            Some(DnsSelection {
                provider: "route53".into(),
                domain: "shoot.project.example.com".into(),
            })
        );
        assert_eq!(select_provider(&providers, "shoot.aexample.com"), None);
        assert!(select_provider(&providers, "example.com").is_some());
    }

    #[test]
    fn longest_include_wins() {
        let providers = vec![
            provider("route53", &["example.com"], &[]),
            provider("clouddns", &["project.example.com"], &[]),
        ];
        let selection = select_provider(&providers, "shoot.project.example.com").unwrap();
        assert_eq!(selection.provider, "clouddns");
    }

    #[test]
    fn exclusions_skip_providers() {
        let providers = vec![
            provider("route53", &["example.com"], &["internal.example.com"]),
            provider("azure-dns", &["example.com"], &[]),
        ];
        let selection = select_provider(&providers, "api.internal.example.com").unwrap();
        assert_eq!(selection.provider, "azure-dns");
    }

    #[test]
    fn matching_ignores_case_and_trailing_dots() {
        assert!(is_subdomain("Shoot.Example.com.", "example.COM"));
        assert!(!is_subdomain("example.com", ""));
    }
}
