//! Configuration: the on-disk model, validation into a runtime snapshot and
//! the atomically swappable store.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use dns_types::DomainName;
use parking_lot::RwLock;
use resolver::Snapshot;
use resolver::cache::DEFAULT_MAX_ENTRIES;
use resolver::hosts::{self, HostOverride, HostsTable};
use resolver::rules::{Pattern, Rule, RuleSet};
use resolver::upstream::{Address, Transport, Upstream};
use serde::{Deserialize, Serialize};

/// The configuration file as written by the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub upstreams: Vec<UpstreamSection>,
    #[serde(default)]
    pub rule_groups: Vec<RuleGroupSection>,
    #[serde(default)]
    pub hosts: Vec<HostSection>,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenSection {
    #[serde(default = "default_dns_listen")]
    pub udp: String,
    #[serde(default = "default_dns_listen")]
    pub tcp: String,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            udp: default_dns_listen(),
            tcp: default_dns_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSection {
    pub name: String,
    pub address: String,
    #[serde(rename = "type")]
    pub transport: Transport,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroupSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub via: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub pin_ttl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSection {
    pub name: String,
    #[serde(default)]
    pub a: Vec<Ipv4Addr>,
    #[serde(default)]
    pub aaaa: Vec<Ipv6Addr>,
    #[serde(default = "default_host_ttl")]
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_http_listen(),
        }
    }
}

fn default_dns_listen() -> String {
    ":53".to_owned()
}

fn default_http_listen() -> String {
    ":8080".to_owned()
}

fn default_weight() -> u32 {
    1
}

fn default_host_ttl() -> u32 {
    hosts::DEFAULT_TTL
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_true() -> bool {
    true
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Validates the file into an immutable runtime snapshot.
    pub fn validate(&self) -> Result<RuntimeConfig> {
        let listen_udp = parse_listen(&self.listen.udp)
            .with_context(|| format!("Invalid UDP listen address '{}'", self.listen.udp))?;
        let listen_tcp = parse_listen(&self.listen.tcp)
            .with_context(|| format!("Invalid TCP listen address '{}'", self.listen.tcp))?;

        if self.upstreams.is_empty() {
            bail!("At least one upstream must be configured");
        }

        let mut upstreams = Vec::with_capacity(self.upstreams.len());
        for section in &self.upstreams {
            if section.name.is_empty() {
                bail!("Upstreams must be named");
            }

            if upstreams
                .iter()
                .any(|existing: &Upstream| existing.name == section.name)
            {
                bail!("Duplicate upstream name '{}'", section.name);
            }

            let address = Address::parse(section.transport, &section.address)
                .with_context(|| format!("Invalid address for upstream '{}'", section.name))?;

            upstreams.push(Upstream {
                name: section.name.clone(),
                transport: section.transport,
                address,
                weight: section.weight,
            });
        }

        // Rule groups are config sugar; the engine works on the flat list.
        let mut rules = Vec::new();
        for group in &self.rule_groups {
            steer::validate_interface(&group.via)
                .with_context(|| format!("Invalid 'via' in rule group '{}'", group.name))?;

            for pattern in &group.patterns {
                let pattern = Pattern::parse(pattern)
                    .with_context(|| format!("Invalid pattern in rule group '{}'", group.name))?;

                rules.push(Rule {
                    pattern,
                    via: group.via.clone(),
                    pin_ttl: group.pin_ttl,
                });
            }
        }

        let mut overrides = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let name = DomainName::vec_from_str(&host.name.to_ascii_lowercase())
                .map_err(|_| anyhow::anyhow!("Invalid host name '{}'", host.name))?;

            overrides.push(HostOverride {
                name,
                a: host.a.clone(),
                aaaa: host.aaaa.clone(),
                ttl: host.ttl,
            });
        }

        let http_listen = match self.http.enabled {
            true => Some(parse_listen(&self.http.listen).with_context(|| {
                format!("Invalid HTTP listen address '{}'", self.http.listen)
            })?),
            false => None,
        };

        Ok(RuntimeConfig {
            listen_udp,
            listen_tcp,
            cache_max_entries: self.cache.max_entries,
            http_listen,
            snapshot: Arc::new(Snapshot {
                rules: RuleSet::new(rules),
                hosts: HostsTable::new(overrides),
                upstreams,
                cache_enabled: self.cache.enabled,
            }),
        })
    }
}

/// A validated configuration, shared immutably.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub listen_udp: SocketAddr,
    pub listen_tcp: SocketAddr,
    pub cache_max_entries: usize,
    /// `None` when the admin API is disabled.
    pub http_listen: Option<SocketAddr>,
    pub snapshot: Arc<Snapshot>,
}

/// Listen addresses accept the `:53` shorthand for all-interfaces.
fn parse_listen(raw: &str) -> Result<SocketAddr> {
    if let Some(port) = raw.strip_prefix(':') {
        let port = port.parse::<u16>().context("Invalid port")?;

        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    raw.parse::<SocketAddr>()
        .with_context(|| format!("'{raw}' is not a socket address"))
}

/// Publishes the active configuration; queries capture an [`Arc`] and swaps
/// replace it atomically for everyone after them.
pub struct Store {
    current: RwLock<Arc<RuntimeConfig>>,
}

impl Store {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn current(&self) -> Arc<RuntimeConfig> {
        self.current.read().clone()
    }

    pub fn swap(&self, config: RuntimeConfig) -> Arc<RuntimeConfig> {
        let config = Arc::new(config);

        *self.current.write() = config.clone();

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [listen]
        udp = ":5533"
        tcp = ":5533"

        [[upstreams]]
        name = "cloudflare"
        address = "1.1.1.1"
        type = "udp"
        weight = 10

        [[upstreams]]
        name = "quad9-dot"
        address = "dns.quad9.net"
        type = "dot"
        weight = 5

        [[rule_groups]]
        name = "work"
        description = "Work traffic through the VPN"
        via = "tun0"
        patterns = ["*.corp.example", "**.vpn.test"]
        pin_ttl = true

        [[hosts]]
        name = "printer.lan"
        a = ["192.168.1.9"]

        [cache]
        enabled = true
        max_entries = 5000

        [http]
        enabled = false
    "#;

    #[test]
    fn example_config_validates() {
        let file: ConfigFile = toml::from_str(EXAMPLE).unwrap();

        let config = file.validate().unwrap();

        assert_eq!(config.listen_udp.port(), 5533);
        assert_eq!(config.snapshot.upstreams.len(), 2);
        assert_eq!(config.snapshot.rules.iter().count(), 3);
        assert!(!config.snapshot.hosts.is_empty());
        assert_eq!(config.cache_max_entries, 5000);
        assert_eq!(config.http_listen, None);
    }

    #[test]
    fn empty_upstreams_are_rejected() {
        let file: ConfigFile = toml::from_str("").unwrap();

        assert!(file.validate().is_err());
    }

    #[test]
    fn duplicate_upstream_names_are_rejected() {
        let file: ConfigFile = toml::from_str(
            r#"
            [[upstreams]]
            name = "a"
            address = "1.1.1.1"
            type = "udp"

            [[upstreams]]
            name = "a"
            address = "9.9.9.9"
            type = "udp"
            "#,
        )
        .unwrap();

        assert!(file.validate().is_err());
    }

    #[test]
    fn invalid_rule_pattern_is_rejected() {
        let file: ConfigFile = toml::from_str(
            r#"
            [[upstreams]]
            name = "a"
            address = "1.1.1.1"
            type = "udp"

            [[rule_groups]]
            name = "broken"
            via = "tun0"
            patterns = ["*partial.example"]
            "#,
        )
        .unwrap();

        assert!(file.validate().is_err());
    }

    #[test]
    fn invalid_via_is_rejected() {
        let file: ConfigFile = toml::from_str(
            r#"
            [[upstreams]]
            name = "a"
            address = "1.1.1.1"
            type = "udp"

            [[rule_groups]]
            name = "broken"
            via = "tun0; reboot"
            patterns = ["*.example.com"]
            "#,
        )
        .unwrap();

        assert!(file.validate().is_err());
    }

    #[test]
    fn swap_publishes_to_new_readers_only() {
        let file: ConfigFile = toml::from_str(EXAMPLE).unwrap();
        let store = Store::new(file.validate().unwrap());

        let before = store.current();

        let mut changed = file;
        changed.cache.max_entries = 1;
        store.swap(changed.validate().unwrap());

        assert_eq!(before.cache_max_entries, 5000); // In-flight reference is untouched.
        assert_eq!(store.current().cache_max_entries, 1);
    }
}
