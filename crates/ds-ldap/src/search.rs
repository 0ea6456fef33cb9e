//! Root DSE retrieval.

use std::collections::HashMap;
use std::time::Duration;

use ds_spi::RootDse;
use ldap3::{Ldap, Scope, SearchEntry, SearchResult};
use tracing::trace;

use crate::error::{check, LdapResult};

/// Attributes requested from the root DSE.
pub const ROOT_DSE_ATTRIBUTES: [&str; 4] = [
    "supportedSASLMechanisms",
    "namingContexts",
    "dnsHostName",
    "ldapServiceName",
];

/// Reads the root DSE through `ldap`.
pub(crate) async fn read_root_dse(ldap: &mut Ldap, timeout: Duration) -> LdapResult<RootDse> {
    let SearchResult(entries, result) = ldap
        .with_timeout(timeout)
        .search("", Scope::Base, "(objectClass=*)", ROOT_DSE_ATTRIBUTES.to_vec())
        .await?;
    check(result)?;

    let dse = entries
        .into_iter()
        .next()
        .map(|entry| root_dse_from_entry(SearchEntry::construct(entry)))
        .unwrap_or_default();
    trace!(
        mechanisms = ?dse.sasl_mechanisms,
        contexts = dse.naming_contexts.len(),
        "read root DSE"
    );
    Ok(dse)
}

/// Builds a [`RootDse`] from a search entry.
///
/// Attribute names are matched without regard to case.
#[must_use]
pub fn root_dse_from_entry(entry: SearchEntry) -> RootDse {
    let attrs: HashMap<String, Vec<String>> = entry
        .attrs
        .into_iter()
        .map(|(name, values)| (name.to_ascii_lowercase(), values))
        .collect();
    let all = |name: &str| attrs.get(name).cloned().unwrap_or_default();
    let first = |name: &str| attrs.get(name).and_then(|v| v.first()).cloned();

    RootDse {
        sasl_mechanisms: all("supportedsaslmechanisms"),
        naming_contexts: all("namingcontexts"),
        dns_host_name: first("dnshostname"),
        service_principal: first("ldapservicename"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ds_core::SaslMechanism;

    fn entry(attrs: &[(&str, &[&str])]) -> SearchEntry {
        SearchEntry {
            dn: String::new(),
            attrs: attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.iter().map(|s| (*s).to_string()).collect()))
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn parses_mechanisms_and_contexts() {
        let dse = root_dse_from_entry(entry(&[
            ("supportedSASLMechanisms", &["GSSAPI", "CRAM-MD5"]),
            ("namingContexts", &["dc=example,dc=com", "cn=config"]),
            ("dnsHostName", &["dc1.example.com"]),
        ]));
        assert!(dse.supports(SaslMechanism::Gssapi));
        assert_eq!(dse.naming_contexts.len(), 2);
        assert_eq!(dse.dns_host_name.as_deref(), Some("dc1.example.com"));
        assert_eq!(dse.service_principal, None);
    }

    #[test]
    fn attribute_names_ignore_case() {
        let dse = root_dse_from_entry(entry(&[
            ("SUPPORTEDSASLMECHANISMS", &["DIGEST-MD5"]),
            ("ldapservicename", &["example.com:dc1$@EXAMPLE.COM"]),
        ]));
        assert!(dse.supports(SaslMechanism::DigestMd5));
        assert_eq!(
            dse.service_principal.as_deref(),
            Some("example.com:dc1$@EXAMPLE.COM")
        );
    }

    #[test]
    fn empty_entry_yields_empty_dse() {
        assert_eq!(root_dse_from_entry(entry(&[])), RootDse::default());
    }
}
