use std::fs;
use std::path::PathBuf;

use ethers::abi::Abi;
use ethers::types::Bytes;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Compiled-contract metadata as the deployer consumes it.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractArtifact {
    pub abi: Abi,
    pub bytecode: Bytes,
}

/// Resolves a logical facet or proxy name to compiled metadata.
pub trait ArtifactResolver: Send + Sync {
    /// Actual contract name behind a logical one, mock fallback included.
    fn contract_name(&self, logical: &str) -> Result<String>;
    fn artifact(&self, logical: &str) -> Result<ContractArtifact>;
}

/// Reads `<dir>/<Name>.json` documents of the shape `{abi, bytecode}`.
/// When the primary name is missing, `<Name>Mock.json` is tried, so test
/// deployments can substitute mock contracts without config changes.
#[derive(Debug, Clone)]
pub struct DirArtifactResolver {
    dir: PathBuf,
}

impl DirArtifactResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactResolver for DirArtifactResolver {
    fn contract_name(&self, logical: &str) -> Result<String> {
        if self.dir.join(format!("{logical}.json")).is_file() {
            return Ok(logical.to_owned());
        }
        let mock = format!("{logical}Mock");
        if self.dir.join(format!("{mock}.json")).is_file() {
            return Ok(mock);
        }
        Err(Error::Artifact(format!(
            "no artifact for {logical} (or {mock}) under {}",
            self.dir.display()
        )))
    }

    fn artifact(&self, logical: &str) -> Result<ContractArtifact> {
        let name = self.contract_name(logical)?;
        let path = self.dir.join(format!("{name}.json"));
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::Artifact(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Artifact(format!("corrupt artifact {}: {e}", path.display())))
    }
}
