use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::config::DeploymentId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Checkpoint of one named unit of deployment work. A completed step is
/// never re-executed within the same deployment id; a failed one is
/// retried on the next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub step_name: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentStep {
    pub fn pending(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            step_name: name.into(),
            description: description.into(),
            status: StepStatus::Pending,
            tx_hash: None,
            contract_address: None,
            gas_used: None,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// What a finished step leaves behind; unset fields keep their prior value.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub tx_hash: Option<String>,
    pub contract_address: Option<Address>,
    pub gas_used: Option<U256>,
    pub error: Option<String>,
}

pub trait StepStore: Send + Sync {
    fn save_step(&self, step: DeploymentStep) -> Result<()>;
    fn get_step(&self, name: &str) -> Result<Option<DeploymentStep>>;
    fn update_status(&self, name: &str, status: StepStatus, outcome: StepOutcome) -> Result<()>;
    fn is_step_completed(&self, name: &str) -> Result<bool>;
    fn mark_deployment_complete(&self) -> Result<()>;
    fn mark_deployment_failed(&self, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeploymentRun {
    deployment_id: String,
    status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    steps: BTreeMap<String, DeploymentStep>,
}

impl DeploymentRun {
    fn fresh(id: &DeploymentId) -> Self {
        Self {
            deployment_id: id.to_string(),
            status: RunStatus::InProgress,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            steps: BTreeMap::new(),
        }
    }
}

/// Step store persisted as one JSON document per deployment id.
///
/// An interrupted or failed run resumes with its step map intact; a run
/// previously marked complete starts over with a fresh map, so upgrade
/// runs re-execute every phase.
pub struct JsonStepStore {
    path: PathBuf,
    run: Mutex<DeploymentRun>,
}

impl JsonStepStore {
    pub fn open(dir: &Path, id: &DeploymentId) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Store(format!("cannot create {}: {e}", dir.display())))?;
        let path = dir.join(format!("{id}.steps.json"));
        let run = match load_run(&path)? {
            Some(mut run) if run.status != RunStatus::Complete => {
                run.status = RunStatus::InProgress;
                run.error = None;
                run.finished_at = None;
                run
            }
            _ => DeploymentRun::fresh(id),
        };
        let store = Self {
            path,
            run: Mutex::new(run),
        };
        store.persist()?;
        Ok(store)
    }

    fn persist(&self) -> Result<()> {
        let run = self.lock()?;
        let raw = serde_json::to_string_pretty(&*run)
            .map_err(|e| Error::Store(format!("cannot encode step record: {e}")))?;
        fs::write(&self.path, raw)
            .map_err(|e| Error::Store(format!("cannot write {}: {e}", self.path.display())))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DeploymentRun>> {
        self.run
            .lock()
            .map_err(|_| Error::Store("step store lock poisoned".into()))
    }
}

fn load_run(path: &Path) -> Result<Option<DeploymentRun>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Store(format!("cannot read {}: {e}", path.display())))?;
    let run = serde_json::from_str(&raw)
        .map_err(|e| Error::Store(format!("corrupt step record {}: {e}", path.display())))?;
    Ok(Some(run))
}

impl StepStore for JsonStepStore {
    fn save_step(&self, step: DeploymentStep) -> Result<()> {
        {
            let mut run = self.lock()?;
            run.steps.insert(step.step_name.clone(), step);
        }
        self.persist()
    }

    fn get_step(&self, name: &str) -> Result<Option<DeploymentStep>> {
        Ok(self.lock()?.steps.get(name).cloned())
    }

    fn update_status(&self, name: &str, status: StepStatus, outcome: StepOutcome) -> Result<()> {
        {
            let mut run = self.lock()?;
            let step = run
                .steps
                .get_mut(name)
                .ok_or_else(|| Error::Store(format!("unknown step {name:?}")))?;
            step.status = status;
            step.timestamp = Utc::now();
            if let Some(tx_hash) = outcome.tx_hash {
                step.tx_hash = Some(tx_hash);
            }
            if let Some(address) = outcome.contract_address {
                step.contract_address = Some(address);
            }
            if let Some(gas_used) = outcome.gas_used {
                step.gas_used = Some(gas_used);
            }
            if let Some(error) = outcome.error {
                step.error = Some(error);
            }
        }
        self.persist()
    }

    fn is_step_completed(&self, name: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .steps
            .get(name)
            .map(|step| step.status == StepStatus::Completed)
            .unwrap_or(false))
    }

    fn mark_deployment_complete(&self) -> Result<()> {
        {
            let mut run = self.lock()?;
            run.status = RunStatus::Complete;
            run.finished_at = Some(Utc::now());
        }
        self.persist()
    }

    fn mark_deployment_failed(&self, reason: &str) -> Result<()> {
        {
            let mut run = self.lock()?;
            run.status = RunStatus::Failed;
            run.error = Some(reason.to_owned());
            run.finished_at = Some(Utc::now());
        }
        self.persist()
    }
}
