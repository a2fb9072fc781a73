use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::selector::Selector;

pub const DEFAULT_FACET_PRIORITY: u32 = 1000;

pub const MIN_GAS_MULTIPLIER: f64 = 1.0;
pub const MAX_GAS_MULTIPLIER: f64 = 2.0;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const MIN_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
pub const MAX_RETRY_BASE_DELAY: Duration = Duration::from_secs(30);

/// Declared shape of one diamond: which facets it carries, at which
/// versions, and which facet (if any) runs the protocol initializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiamondConfig {
    pub diamond_name: String,
    #[serde(default)]
    pub protocol_version: u64,
    #[serde(default)]
    pub protocol_init_facet: Option<String>,
    #[serde(default)]
    pub facets: BTreeMap<String, FacetConfig>,
}

impl DiamondConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            Error::Configuration(format!("cannot parse config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.diamond_name.trim().is_empty() {
            return Err(Error::Configuration("diamondName must not be empty".into()));
        }
        if let Some(init_facet) = &self.protocol_init_facet {
            if !self.facets.contains_key(init_facet) {
                return Err(Error::Configuration(format!(
                    "protocolInitFacet {init_facet:?} is not a configured facet"
                )));
            }
        }
        for facet in self.facets.values() {
            if let Some(version) = facet.version_config() {
                version.include_overrides()?;
                version.exclude_overrides()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetConfig {
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub versions: BTreeMap<u64, FacetVersionConfig>,
}

fn default_priority() -> u32 {
    DEFAULT_FACET_PRIORITY
}

impl FacetConfig {
    /// Highest declared version; the version a deployment run drives toward.
    pub fn target_version(&self) -> u64 {
        self.versions.keys().next_back().copied().unwrap_or(0)
    }

    pub fn version_config(&self) -> Option<&FacetVersionConfig> {
        self.versions.values().next_back()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetVersionConfig {
    #[serde(default)]
    pub deploy_init: Option<String>,
    #[serde(default)]
    pub upgrade_init: Option<String>,
    #[serde(default)]
    pub deploy_include: Vec<String>,
    #[serde(default)]
    pub deploy_exclude: Vec<String>,
    #[serde(default)]
    pub callbacks: Vec<String>,
}

impl FacetVersionConfig {
    pub fn include_overrides(&self) -> Result<BTreeSet<Selector>> {
        parse_selectors(&self.deploy_include)
    }

    pub fn exclude_overrides(&self) -> Result<BTreeSet<Selector>> {
        parse_selectors(&self.deploy_exclude)
    }
}

fn parse_selectors(raw: &[String]) -> Result<BTreeSet<Selector>> {
    raw.iter().map(|s| s.parse()).collect()
}

/// One facet as the reconciliation engine sees it: the declared identity
/// plus the address assigned once the contract is deployed.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetDescriptor {
    pub name: String,
    pub priority: u32,
    pub address: Option<Address>,
    pub selectors: BTreeSet<Selector>,
    pub include_overrides: BTreeSet<Selector>,
    pub exclude_overrides: BTreeSet<Selector>,
}

impl FacetDescriptor {
    pub fn new(name: impl Into<String>, priority: u32, selectors: BTreeSet<Selector>) -> Self {
        Self {
            name: name.into(),
            priority,
            address: None,
            selectors,
            include_overrides: BTreeSet::new(),
            exclude_overrides: BTreeSet::new(),
        }
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_includes(mut self, selectors: BTreeSet<Selector>) -> Self {
        self.include_overrides = selectors;
        self
    }

    pub fn with_excludes(mut self, selectors: BTreeSet<Selector>) -> Self {
        self.exclude_overrides = selectors;
        self
    }
}

/// Connection and tuning knobs, validated before any I/O happens.
#[derive(Debug, Clone)]
pub struct DeployerSettings {
    pub rpc_url: String,
    pub private_key: String,
    pub network_name: String,
    pub gas_multiplier: f64,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_jitter: bool,
}

impl DeployerSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://"))
            || self.rpc_url.contains(char::is_whitespace)
        {
            return Err(Error::Configuration(format!(
                "malformed RPC endpoint {:?}",
                self.rpc_url
            )));
        }
        let key = self.private_key.strip_prefix("0x").unwrap_or(&self.private_key);
        if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Configuration(
                "private key must be 32 bytes of hex".into(),
            ));
        }
        if self.network_name.trim().is_empty() {
            return Err(Error::Configuration("network name must not be empty".into()));
        }
        if !(MIN_GAS_MULTIPLIER..=MAX_GAS_MULTIPLIER).contains(&self.gas_multiplier) {
            return Err(Error::Configuration(format!(
                "gas multiplier {} outside [{MIN_GAS_MULTIPLIER}, {MAX_GAS_MULTIPLIER}]",
                self.gas_multiplier
            )));
        }
        if self.max_retries == 0 || self.max_retries > MAX_RETRY_ATTEMPTS {
            return Err(Error::Configuration(format!(
                "max retries {} outside [1, {MAX_RETRY_ATTEMPTS}]",
                self.max_retries
            )));
        }
        if !(MIN_RETRY_BASE_DELAY..=MAX_RETRY_BASE_DELAY).contains(&self.retry_base_delay) {
            return Err(Error::Configuration(format!(
                "retry base delay {:?} outside [{MIN_RETRY_BASE_DELAY:?}, {MAX_RETRY_BASE_DELAY:?}]",
                self.retry_base_delay
            )));
        }
        Ok(())
    }
}

/// Stable key of one diamond on one network: `<diamond>-<network>-<chain id>`,
/// names lowercased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeploymentId {
    diamond: String,
    network: String,
    chain_id: u64,
}

impl DeploymentId {
    pub fn new(diamond: &str, network: &str, chain_id: u64) -> Self {
        Self {
            diamond: diamond.to_lowercase(),
            network: network.to_lowercase(),
            chain_id,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.diamond, self.network, self.chain_id)
    }
}
