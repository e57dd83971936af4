//! Server Catalog
//!
//! Resolves a [`ConnectIntent`] into candidate servers, best first.
//!
//! The catalog is a TOML or JSON document listing logical servers:
//!
//! ```toml
//! [[servers]]
//! id = "ch-12"
//! name = "CH#12"
//! exit_country = "CH"
//! score = 1.2
//!
//! [[servers.domains]]
//! id = "ch-12-a"
//! entry_domain = "node-ch-12.example.net"
//! entry_ip = "203.0.113.12"
//! exit_ip = "203.0.113.13"
//! protocols = [{ protocol = "wireguard" }]
//! ```

use crate::config::{ConfigError, ConfigFormat};
use crate::intent::{ConnectIntent, ServerFeature};
use crate::server::Server;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Server/intent resolver
#[async_trait]
pub trait ServerResolver: Send + Sync {
    /// Candidate servers for an intent, best first. Never empty on success.
    async fn resolve(&self, intent: &ConnectIntent) -> Result<Vec<Server>, ResolveError>;

    /// Look up a server by id
    async fn server_by_id(&self, id: &str) -> Option<Server>;

    /// Other servers to switch to once every candidate for `intent` failed,
    /// most compatible first. `exclude` lists server ids already tried.
    async fn fallbacks(&self, _intent: &ConnectIntent, _exclude: &[String]) -> Vec<Server> {
        Vec::new()
    }
}

/// Fallback servers handed out per failed intent
pub const FALLBACK_SERVERS: usize = 5;

// Compatibility aspects, higher bits weigh more
const FEATURES: u32 = 1 << 0;
const GATEWAY: u32 = 1 << 1;
const CITY: u32 = 1 << 2;
const COUNTRY: u32 = 1 << 3;
const SECURE_CORE: u32 = 1 << 4;

/// How well `server` stands in for the intent's destination
fn compatibility(intent: &ConnectIntent, direct: Option<&Server>, server: &Server) -> u32 {
    let country = |c: &str| {
        if server.exit_country.eq_ignore_ascii_case(c) { COUNTRY } else { 0 }
    };
    let city = |c: Option<&str>| match (c, server.city.as_deref()) {
        (Some(want), Some(have)) if want.eq_ignore_ascii_case(have) => CITY,
        _ => 0,
    };
    let like_direct = || {
        direct.map_or(0, |d| country(&d.exit_country) | city(d.city.as_deref()))
    };

    let mut score = match intent {
        ConnectIntent::FastestInCountry { country: c, .. } => country(c),
        ConnectIntent::FastestInCity {
            country: c,
            city: town,
            ..
        } => country(c) | city(Some(town.as_str())),
        ConnectIntent::SecureCore { exit_country, .. } => country(exit_country),
        ConnectIntent::Gateway { name, .. } => {
            let gateway = if server.gateway.as_deref() == Some(name.as_str()) { GATEWAY } else { 0 };
            gateway | like_direct()
        }
        ConnectIntent::Server { .. } => like_direct(),
        ConnectIntent::GuestHole { .. } => 0,
    };
    if server.has_features(&intent.required_features()) {
        score |= FEATURES;
    }
    if matches!(intent, ConnectIntent::SecureCore { .. }) == server.is_secure_core() {
        score |= SECURE_CORE;
    }
    score
}

/// In-memory catalog loaded from a file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCatalog {
    /// All servers
    #[serde(default)]
    pub servers: Vec<Server>,
}

impl ServerCatalog {
    /// Create from a list of servers
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    /// Load from a TOML or JSON file, chosen by extension
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let format = ConfigFormat::from_path(path)?;
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_str(&content, format)
    }

    /// Load from a string
    pub fn from_str(content: &str, format: ConfigFormat) -> Result<Self, CatalogError> {
        let catalog: ServerCatalog = format.parse(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check ids are unique and every server has a domain
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(CatalogError::DuplicateServer(server.id.clone()));
            }
            if server.domains.is_empty() {
                return Err(CatalogError::NoDomains(server.id.clone()));
            }
        }
        Ok(())
    }

    /// Find a server by id
    pub fn find(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    fn online(&self) -> impl Iterator<Item = &Server> {
        self.servers
            .iter()
            .filter(|s| s.online && s.domains.iter().any(|d| d.online))
    }

    /// Order servers best first: lowest score, then lowest load
    fn rank(mut servers: Vec<&Server>) -> Vec<Server> {
        servers.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then(a.load.cmp(&b.load))
                .then(a.id.cmp(&b.id))
        });
        servers.into_iter().cloned().collect()
    }

    /// Candidates for an intent, best first
    pub fn candidates(&self, intent: &ConnectIntent) -> Result<Vec<Server>, ResolveError> {
        let features = intent.required_features();
        let matching: Vec<&Server> = match intent {
            ConnectIntent::FastestInCountry { country, .. } => self
                .online()
                .filter(|s| s.exit_country.eq_ignore_ascii_case(country))
                .filter(|s| s.gateway.is_none())
                .filter(|s| s.has_features(&features))
                .collect(),
            ConnectIntent::FastestInCity { country, city, .. } => self
                .online()
                .filter(|s| s.exit_country.eq_ignore_ascii_case(country))
                .filter(|s| {
                    s.city
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case(city))
                })
                .filter(|s| s.gateway.is_none())
                .filter(|s| s.has_features(&features))
                .collect(),
            ConnectIntent::Server { server_id } | ConnectIntent::GuestHole { server_id } => {
                let server = self
                    .find(server_id)
                    .ok_or_else(|| ResolveError::UnknownServer(server_id.clone()))?;
                if !server.online {
                    return Err(ResolveError::Offline(server_id.clone()));
                }
                vec![server]
            }
            ConnectIntent::SecureCore {
                entry_country,
                exit_country,
            } => self
                .online()
                .filter(|s| s.is_secure_core())
                .filter(|s| s.exit_country.eq_ignore_ascii_case(exit_country))
                .filter(|s| match (entry_country, &s.entry_country) {
                    (None, _) => true,
                    (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
                    (Some(_), None) => false,
                })
                .collect(),
            ConnectIntent::Gateway { name, server_id } => self
                .online()
                .filter(|s| s.gateway.as_deref() == Some(name.as_str()))
                .filter(|s| server_id.as_ref().is_none_or(|id| &s.id == id))
                .collect(),
        };

        if matching.is_empty() {
            return Err(ResolveError::NoMatch(intent.to_string()));
        }
        let ranked = Self::rank(matching);
        debug!("Resolved {} to {} candidate(s)", intent, ranked.len());
        Ok(ranked)
    }

    /// Online servers compatible with `intent`, best first, skipping
    /// `exclude`. Gateway servers only stand in for their own gateway; Tor
    /// servers only when Tor was asked for.
    pub fn compatible(&self, intent: &ConnectIntent, exclude: &[String]) -> Vec<Server> {
        if intent.is_guest_hole() {
            return Vec::new();
        }
        let direct = match intent {
            ConnectIntent::Server { server_id }
            | ConnectIntent::Gateway {
                server_id: Some(server_id),
                ..
            } => self.find(server_id),
            _ => None,
        };
        let gateway = match intent {
            ConnectIntent::Gateway { name, .. } => Some(name.as_str()),
            _ => None,
        };
        let tor = ServerFeature::Tor;
        let wants_tor = intent.required_features().contains(&tor)
            || direct.is_some_and(|d| d.features.contains(&tor));

        let eligible: Vec<&Server> = self
            .online()
            .filter(|s| !exclude.contains(&s.id))
            .filter(|s| s.gateway.as_deref() == gateway)
            .filter(|s| wants_tor || !s.features.contains(&tor))
            .collect();
        let mut scored: Vec<(u32, Server)> = Self::rank(eligible)
            .into_iter()
            .map(|s| (compatibility(intent, direct, &s), s))
            .collect();
        // Stable, so equal scores keep the score/load ranking
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(FALLBACK_SERVERS)
            .map(|(_, s)| s)
            .collect()
    }
}

#[async_trait]
impl ServerResolver for ServerCatalog {
    async fn resolve(&self, intent: &ConnectIntent) -> Result<Vec<Server>, ResolveError> {
        self.candidates(intent)
    }

    async fn server_by_id(&self, id: &str) -> Option<Server> {
        self.find(id).cloned()
    }

    async fn fallbacks(&self, intent: &ConnectIntent, exclude: &[String]) -> Vec<Server> {
        self.compatible(intent, exclude)
    }
}

/// Catalog loading errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Duplicate server id: {0}")]
    DuplicateServer(String),

    #[error("Server {0} has no connecting domains")]
    NoDomains(String),
}

/// Resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("No server matches {0}")]
    NoMatch(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Server {0} is offline")]
    Offline(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VpnProtocol;
    use crate::server::DomainProtocol;
    use crate::server::fixtures::{domain, server};

    fn catalog() -> ServerCatalog {
        let wg = || vec![domain("d", vec![DomainProtocol::all(VpnProtocol::WireGuard)])];
        let mut ch1 = server("CH1", "CH", wg());
        ch1.score = 2.0;
        ch1.city = Some("Zurich".into());
        let mut ch2 = server("CH2", "CH", wg());
        ch2.score = 1.0;
        let mut ch3 = server("CH3", "CH", wg());
        ch3.online = false;
        ch3.score = 0.1;
        let mut sc = server("SC1", "DE", wg());
        sc.features = vec![ServerFeature::SecureCore];
        sc.entry_country = Some("IS".into());
        let mut gw = server("GW1", "US", wg());
        gw.gateway = Some("acme".into());
        ServerCatalog::new(vec![ch1, ch2, ch3, sc, gw])
    }

    fn ids(servers: &[Server]) -> Vec<&str> {
        servers.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_fastest_in_country_ranked() {
        let c = catalog();
        let result = c.candidates(&ConnectIntent::fastest_in("ch")).unwrap();
        assert_eq!(ids(&result), vec!["CH2", "CH1"]);
    }

    #[test]
    fn test_fastest_in_city() {
        let c = catalog();
        let intent = ConnectIntent::FastestInCity {
            country: "CH".into(),
            city: "zurich".into(),
            features: vec![],
        };
        assert_eq!(ids(&c.candidates(&intent).unwrap()), vec!["CH1"]);
    }

    #[test]
    fn test_secure_core_pair() {
        let c = catalog();
        let intent = ConnectIntent::SecureCore {
            entry_country: Some("IS".into()),
            exit_country: "DE".into(),
        };
        assert_eq!(ids(&c.candidates(&intent).unwrap()), vec!["SC1"]);

        let wrong_entry = ConnectIntent::SecureCore {
            entry_country: Some("SE".into()),
            exit_country: "DE".into(),
        };
        assert!(c.candidates(&wrong_entry).is_err());
    }

    #[test]
    fn test_gateway_excluded_from_country() {
        let c = catalog();
        assert!(c.candidates(&ConnectIntent::fastest_in("US")).is_err());
        let gw = ConnectIntent::Gateway {
            name: "acme".into(),
            server_id: None,
        };
        assert_eq!(ids(&c.candidates(&gw).unwrap()), vec!["GW1"]);
    }

    #[test]
    fn test_specific_server() {
        let c = catalog();
        assert_eq!(
            c.candidates(&ConnectIntent::server("CH3")),
            Err(ResolveError::Offline("CH3".into()))
        );
        assert_eq!(
            c.candidates(&ConnectIntent::server("nope")),
            Err(ResolveError::UnknownServer("nope".into()))
        );
    }

    #[test]
    fn test_catalog_toml() {
        let toml = r#"
            [[servers]]
            id = "ch-12"
            name = "CH#12"
            exit_country = "CH"

            [[servers.domains]]
            id = "ch-12-a"
            entry_domain = "node-ch-12.example.net"
            entry_ip = "203.0.113.12"
            exit_ip = "203.0.113.13"
            protocols = [{ protocol = "wireguard" }, { protocol = "openvpn", transmissions = ["tcp"] }]
        "#;
        let c = ServerCatalog::from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(c.servers.len(), 1);
        assert!(c.servers[0].online);
        assert_eq!(c.servers[0].domains[0].protocols.len(), 2);
    }

    #[test]
    fn test_compatible_for_specific_server() {
        let wg = || vec![domain("d", vec![DomainProtocol::all(VpnProtocol::WireGuard)])];
        let mut zurich = server("ZH1", "CH", wg());
        zurich.city = Some("Zurich".into());
        let mut zurich2 = server("ZH2", "CH", wg());
        zurich2.city = Some("Zurich".into());
        zurich2.score = 3.0;
        let mut geneva = server("GE1", "CH", wg());
        geneva.city = Some("Geneva".into());
        let de = server("DE1", "DE", wg());
        let mut tor = server("TOR1", "CH", wg());
        tor.features = vec![ServerFeature::Tor];
        tor.city = Some("Zurich".into());
        let mut gw = server("GW1", "CH", wg());
        gw.gateway = Some("acme".into());
        let c = ServerCatalog::new(vec![de, geneva, zurich, zurich2, tor, gw]);

        let fallbacks = c.compatible(&ConnectIntent::server("ZH1"), &["ZH1".to_string()]);
        // Same city first, then same country, then anywhere
        assert_eq!(ids(&fallbacks), vec!["ZH2", "GE1", "DE1"]);
    }

    #[test]
    fn test_compatible_gateway_stays_in_gateway() {
        let c = catalog();
        let gw = ConnectIntent::Gateway {
            name: "acme".into(),
            server_id: None,
        };
        assert!(c.compatible(&gw, &["GW1".to_string()]).is_empty());
        assert!(c.compatible(&ConnectIntent::GuestHole { server_id: "CH1".into() }, &[]).is_empty());
    }

    #[test]
    fn test_compatible_secure_core_prefers_secure_core() {
        let c = catalog();
        let intent = ConnectIntent::SecureCore {
            entry_country: None,
            exit_country: "CH".into(),
        };
        let fallbacks = c.compatible(&intent, &[]);
        assert_eq!(fallbacks[0].id, "SC1");
        assert!(fallbacks.len() <= FALLBACK_SERVERS);
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let s = server("A", "CH", vec![domain("d", vec![])]);
        let c = ServerCatalog::new(vec![s.clone(), s]);
        assert_eq!(c.validate(), Err(CatalogError::DuplicateServer("A".into())));
    }
}
