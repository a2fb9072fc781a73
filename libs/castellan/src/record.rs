use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::config::DeploymentId;
use crate::error::{Error, Result};
use crate::selector::Selector;

/// Authoritative record of what is live on-chain, written after every
/// confirmed cut. The registry is seeded from this, never from the step
/// store. Field names are the external interchange format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployedState {
    #[serde(rename = "DiamondAddress", default, skip_serializing_if = "Option::is_none")]
    pub diamond_address: Option<Address>,
    #[serde(rename = "DeployerAddress", default, skip_serializing_if = "Option::is_none")]
    pub deployer_address: Option<Address>,
    #[serde(rename = "DeployedFacets", default)]
    pub deployed_facets: BTreeMap<String, DeployedFacet>,
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedFacet {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub version: u64,
    #[serde(rename = "funcSelectors", default)]
    pub func_selectors: BTreeSet<Selector>,
}

pub trait DeployedStateStore: Send + Sync {
    fn load(&self, id: &DeploymentId) -> Result<Option<DeployedState>>;
    fn save(&self, id: &DeploymentId, state: &DeployedState) -> Result<()>;
}

/// One JSON document per deployment id under a directory.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &DeploymentId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl DeployedStateStore for JsonStateStore {
    fn load(&self, id: &DeploymentId) -> Result<Option<DeployedState>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = read_file(&path)?;
        let state = serde_json::from_str(&raw).map_err(|e| {
            Error::Store(format!("corrupt deployed-state record {}: {e}", path.display()))
        })?;
        Ok(Some(state))
    }

    fn save(&self, id: &DeploymentId, state: &DeployedState) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Store(format!("cannot create {}: {e}", self.dir.display())))?;
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| Error::Store(format!("cannot encode deployed state: {e}")))?;
        let path = self.path(id);
        fs::write(&path, raw)
            .map_err(|e| Error::Store(format!("cannot write {}: {e}", path.display())))
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Store(format!("cannot read {}: {e}", path.display())))
}
