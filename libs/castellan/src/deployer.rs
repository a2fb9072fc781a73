//! Deployment orchestration.
//!
//! One `deploy()` call drives the full phase order (proxy, facets,
//! reconciliation, cut, initializers, callbacks), checkpointing every step
//! in the step store so an aborted run resumes at the first non-completed
//! step. The deployed-state record, not the step store, is the source the
//! registry is rebuilt from.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::Address;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactResolver;
use crate::client::ChainClient;
use crate::config::{DeploymentId, DiamondConfig, FacetDescriptor, FacetVersionConfig};
use crate::cut::{self, DIAMOND_CUT_SIGNATURE};
use crate::error::{Error, Result};
use crate::record::{DeployedFacet, DeployedState, DeployedStateStore};
use crate::reconcile::reconcile;
use crate::registry::SelectorRegistry;
use crate::selector::{abi_selectors, Selector};
use crate::steps::{DeploymentStep, StepOutcome, StepStatus, StepStore};

pub const STEP_DEPLOY_PROXY: &str = "deploy-proxy-core";
pub const STEP_RECONCILE: &str = "reconcile-registry";
pub const STEP_PERFORM_CUT: &str = "perform-cut";
pub const STEP_CALLBACKS: &str = "run-post-deploy-callbacks";

pub fn facet_step_name(facet: &str) -> String {
    format!("deploy-facet-{facet}")
}

pub fn init_step_name(facet: &str) -> String {
    format!("init-{facet}")
}

pub struct CallbackContext<'a> {
    pub client: &'a dyn ChainClient,
    pub diamond: Address,
    pub state: &'a DeployedState,
}

/// Project-specific hook run after the cut and initializers confirm.
/// Callbacks are named in facet version config and registered on the
/// deployer before the run starts.
#[async_trait]
pub trait PostDeployCallback: Send + Sync {
    async fn run(&self, ctx: CallbackContext<'_>) -> Result<()>;
}

enum StepResult<T> {
    Executed(T),
    Skipped(Option<DeploymentStep>),
}

/// Everything the run knows about one configured facet.
struct FacetPlan {
    descriptor: FacetDescriptor,
    target_version: u64,
    version_config: FacetVersionConfig,
    previously_deployed: bool,
    redeployed: bool,
    tx_hash: Option<String>,
}

pub struct DiamondDeployer {
    id: DeploymentId,
    config: DiamondConfig,
    client: Arc<dyn ChainClient>,
    artifacts: Arc<dyn ArtifactResolver>,
    steps: Arc<dyn StepStore>,
    states: Arc<dyn DeployedStateStore>,
    callbacks: BTreeMap<String, Arc<dyn PostDeployCallback>>,
    in_progress: AtomicBool,
    poll_interval: Duration,
}

impl DiamondDeployer {
    pub fn new(
        id: DeploymentId,
        config: DiamondConfig,
        client: Arc<dyn ChainClient>,
        artifacts: Arc<dyn ArtifactResolver>,
        steps: Arc<dyn StepStore>,
        states: Arc<dyn DeployedStateStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id,
            config,
            client,
            artifacts,
            steps,
            states,
            callbacks: BTreeMap::new(),
            in_progress: AtomicBool::new(false),
            poll_interval: Duration::from_millis(250),
        })
    }

    pub fn deployment_id(&self) -> &DeploymentId {
        &self.id
    }

    /// Registers a named post-deploy callback; call before `deploy()`.
    pub fn register_callback(&mut self, name: impl Into<String>, callback: Arc<dyn PostDeployCallback>) {
        self.callbacks.insert(name.into(), callback);
    }

    /// Runs (or resumes) the deployment and returns the final record.
    ///
    /// A second overlapping call on the same instance does not queue a
    /// second run: it polls until the active run finishes and returns the
    /// record that run produced.
    pub async fn deploy(&self) -> Result<DeployedState> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return self.wait_for_active_run().await;
        }
        let result = self.run().await;
        self.in_progress.store(false, Ordering::SeqCst);
        match &result {
            Ok(_) => self.steps.mark_deployment_complete()?,
            Err(err) => {
                if let Err(store_err) = self.steps.mark_deployment_failed(&err.to_string()) {
                    warn!(error = %store_err, "failed to persist run failure");
                }
            }
        }
        result
    }

    async fn wait_for_active_run(&self) -> Result<DeployedState> {
        debug!(deployment = %self.id, "deployment already in progress, waiting");
        while self.in_progress.load(Ordering::SeqCst) {
            tokio::time::sleep(self.poll_interval).await;
        }
        self.states.load(&self.id)?.ok_or_else(|| {
            Error::Store("concurrent deployment finished without a deployed-state record".into())
        })
    }

    async fn run(&self) -> Result<DeployedState> {
        info!(deployment = %self.id, "starting deployment run");
        self.client.check_connectivity().await?;

        let mut state = self.states.load(&self.id)?.unwrap_or_default();
        let fresh_deployment = state.diamond_address.is_none();

        let diamond = self.ensure_proxy(&mut state).await?;
        let plans = self.deploy_facets(&state).await?;

        let mut registry = self.seed_registry(&state);
        self.reconcile_step(&mut registry, &plans)?;

        self.perform_cut(&mut state, diamond, &mut registry, &plans, fresh_deployment)
            .await?;
        self.run_initializers(diamond, &plans).await?;
        self.run_callbacks(diamond, &state, &plans).await?;

        info!(deployment = %self.id, diamond = ?diamond, "deployment run complete");
        Ok(state)
    }

    /// Step protocol shared by every phase: a completed step is skipped
    /// wholesale, otherwise the status transitions pending → in_progress →
    /// completed/failed are persisted around the work.
    async fn run_step<T, F, Fut>(&self, name: &str, description: &str, op: F) -> Result<StepResult<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, StepOutcome)>>,
    {
        if self.steps.is_step_completed(name)? {
            debug!(step = name, "step already completed, skipping");
            return Ok(StepResult::Skipped(self.steps.get_step(name)?));
        }
        self.steps.save_step(DeploymentStep::pending(name, description))?;
        self.steps
            .update_status(name, StepStatus::InProgress, StepOutcome::default())?;
        info!(step = name, "executing step");
        match op().await {
            Ok((value, outcome)) => {
                self.steps.update_status(name, StepStatus::Completed, outcome)?;
                Ok(StepResult::Executed(value))
            }
            Err(err) => {
                let outcome = StepOutcome {
                    error: Some(err.to_string()),
                    ..StepOutcome::default()
                };
                if let Err(store_err) = self.steps.update_status(name, StepStatus::Failed, outcome) {
                    warn!(step = name, error = %store_err, "failed to persist step failure");
                }
                Err(err)
            }
        }
    }

    /// Phase 1: the proxy contract itself. Skipped when the record already
    /// carries a diamond address from an earlier run.
    async fn ensure_proxy(&self, state: &mut DeployedState) -> Result<Address> {
        if self.steps.is_step_completed(STEP_DEPLOY_PROXY)? {
            if let Some(address) = state.diamond_address {
                return Ok(address);
            }
            // Interrupted before the record was written; the checkpoint
            // has the address.
            let address = self
                .steps
                .get_step(STEP_DEPLOY_PROXY)?
                .and_then(|step| step.contract_address)
                .ok_or_else(|| {
                    Error::Store(format!(
                        "step {STEP_DEPLOY_PROXY} completed without a contract address"
                    ))
                })?;
            state.diamond_address = Some(address);
            return Ok(address);
        }

        if let Some(address) = state.diamond_address {
            let mut step =
                DeploymentStep::pending(STEP_DEPLOY_PROXY, "proxy already deployed");
            step.status = StepStatus::Completed;
            step.contract_address = Some(address);
            self.steps.save_step(step)?;
            return Ok(address);
        }

        let artifact = self.artifacts.artifact(&self.config.diamond_name)?;
        let admin = self.client.sender();
        let result = self
            .run_step(STEP_DEPLOY_PROXY, "deploy the diamond proxy", || async move {
                let deployed = self
                    .client
                    .deploy(&artifact, vec![Token::Address(admin)])
                    .await?;
                let outcome = StepOutcome {
                    tx_hash: Some(format!("{:?}", deployed.tx_hash)),
                    contract_address: Some(deployed.address),
                    gas_used: deployed.gas_used,
                    ..StepOutcome::default()
                };
                Ok((deployed.address, outcome))
            })
            .await?;
        let address = match result {
            StepResult::Executed(address) => address,
            StepResult::Skipped(step) => step.and_then(|s| s.contract_address).ok_or_else(|| {
                Error::Store(format!(
                    "step {STEP_DEPLOY_PROXY} completed without a contract address"
                ))
            })?,
        };
        state.diamond_address = Some(address);
        Ok(address)
    }

    /// Phase 2: facet contracts, in ascending priority order. A facet is
    /// (re)deployed when the record has no entry for it or its recorded
    /// version is behind the highest configured one.
    async fn deploy_facets(&self, state: &DeployedState) -> Result<Vec<FacetPlan>> {
        let mut plans = Vec::new();
        let ordered = self
            .config
            .facets
            .iter()
            .sorted_by_key(|(name, facet)| (facet.priority, (*name).clone()));

        for (name, facet_config) in ordered {
            let target_version = facet_config.target_version();
            let version_config = facet_config.version_config().cloned().unwrap_or_default();
            let include_overrides = version_config.include_overrides()?;
            let exclude_overrides = version_config.exclude_overrides()?;

            let recorded = state.deployed_facets.get(name);
            let previously_deployed = recorded.is_some();
            let needs_deploy = recorded.map_or(true, |facet| facet.version < target_version);

            let artifact = self.artifacts.artifact(name)?;
            let selectors = abi_selectors(&artifact.abi);

            let mut descriptor = FacetDescriptor::new(name.clone(), facet_config.priority, selectors)
                .with_includes(include_overrides)
                .with_excludes(exclude_overrides);

            let mut tx_hash = None;
            if needs_deploy {
                let step = facet_step_name(name);
                let result = self
                    .run_step(&step, &format!("deploy facet {name}"), || async move {
                        let deployed = self.client.deploy(&artifact, Vec::new()).await?;
                        let outcome = StepOutcome {
                            tx_hash: Some(format!("{:?}", deployed.tx_hash)),
                            contract_address: Some(deployed.address),
                            gas_used: deployed.gas_used,
                            ..StepOutcome::default()
                        };
                        Ok((deployed, outcome))
                    })
                    .await?;
                let address = match result {
                    StepResult::Executed(deployed) => {
                        tx_hash = Some(format!("{:?}", deployed.tx_hash));
                        deployed.address
                    }
                    StepResult::Skipped(step_record) => {
                        let step_record = step_record.ok_or_else(|| {
                            Error::Store(format!("step {step} completed but not recorded"))
                        })?;
                        tx_hash = step_record.tx_hash.clone();
                        step_record.contract_address.ok_or_else(|| {
                            Error::Store(format!("step {step} completed without a contract address"))
                        })?
                    }
                };
                descriptor = descriptor.with_address(address);
            } else if let Some(recorded) = recorded {
                descriptor = descriptor.with_address(recorded.address);
            }

            plans.push(FacetPlan {
                descriptor,
                target_version,
                version_config,
                previously_deployed,
                redeployed: needs_deploy,
                tx_hash,
            });
        }
        Ok(plans)
    }

    fn seed_registry(&self, state: &DeployedState) -> SelectorRegistry {
        SelectorRegistry::seeded(state, |facet| {
            self.config
                .facets
                .get(facet)
                .map_or(crate::config::DEFAULT_FACET_PRIORITY, |f| f.priority)
        })
    }

    /// Phase 3: reconciliation. Pure and local, so on resume the result is
    /// recomputed even when the checkpoint says completed; only the
    /// persisted status is skipped, never the computation the cut needs.
    fn reconcile_step(&self, registry: &mut SelectorRegistry, plans: &[FacetPlan]) -> Result<()> {
        let redeployed: Vec<FacetDescriptor> = plans
            .iter()
            .filter(|plan| plan.redeployed)
            .map(|plan| plan.descriptor.clone())
            .collect();
        let configured: BTreeSet<String> = self.config.facets.keys().cloned().collect();

        let already_completed = self.steps.is_step_completed(STEP_RECONCILE)?;
        if !already_completed {
            self.steps.save_step(DeploymentStep::pending(
                STEP_RECONCILE,
                "reconcile selector registry",
            ))?;
            self.steps
                .update_status(STEP_RECONCILE, StepStatus::InProgress, StepOutcome::default())?;
        }
        match reconcile(registry, &redeployed, &configured) {
            Ok(()) => {
                if !already_completed {
                    self.steps.update_status(
                        STEP_RECONCILE,
                        StepStatus::Completed,
                        StepOutcome::default(),
                    )?;
                }
                Ok(())
            }
            Err(err) => {
                if !already_completed {
                    let outcome = StepOutcome {
                        error: Some(err.to_string()),
                        ..StepOutcome::default()
                    };
                    if let Err(store_err) =
                        self.steps
                            .update_status(STEP_RECONCILE, StepStatus::Failed, outcome)
                    {
                        warn!(error = %store_err, "failed to persist step failure");
                    }
                }
                Err(err)
            }
        }
    }

    /// Phase 4: compile and submit the cut, then rewrite the record. The
    /// record write happens inside the step so a completed checkpoint
    /// always implies a persisted record.
    async fn perform_cut(
        &self,
        state: &mut DeployedState,
        diamond: Address,
        registry: &mut SelectorRegistry,
        plans: &[FacetPlan],
        fresh_deployment: bool,
    ) -> Result<()> {
        let facet_addresses: BTreeMap<String, Address> = plans
            .iter()
            .filter_map(|plan| {
                plan.descriptor
                    .address
                    .map(|address| (plan.descriptor.name.clone(), address))
            })
            .collect();

        let result = self
            .run_step(STEP_PERFORM_CUT, "submit the diamond cut", || async move {
                let initializer =
                    cut::resolve_initializer(&self.config, state, &facet_addresses, fresh_deployment)?;
                let plan = cut::compile_plan(registry, initializer)?;
                if plan.is_noop() {
                    info!("cut plan is empty, nothing to submit");
                    return Ok(((), StepOutcome::default()));
                }
                info!(
                    operations = plan.operations.len(),
                    initializer = !plan.initializer.is_noop(),
                    "submitting diamond cut"
                );
                let outcome = self
                    .client
                    .send(diamond, DIAMOND_CUT_SIGNATURE, cut::cut_call_args(&plan))
                    .await?;

                registry.fold_confirmed();
                self.rewrite_record(state, diamond, registry, plans);
                self.states.save(&self.id, state)?;

                let outcome = StepOutcome {
                    tx_hash: Some(format!("{:?}", outcome.tx_hash)),
                    gas_used: outcome.gas_used,
                    ..StepOutcome::default()
                };
                Ok(((), outcome))
            })
            .await?;

        if let StepResult::Skipped(_) = result {
            debug!("cut already confirmed in a previous run");
        }
        Ok(())
    }

    fn rewrite_record(
        &self,
        state: &mut DeployedState,
        diamond: Address,
        registry: &SelectorRegistry,
        plans: &[FacetPlan],
    ) {
        state.diamond_address = Some(diamond);
        state.deployer_address = Some(self.client.sender());
        state.protocol_version = self.config.protocol_version;

        let mut facets = BTreeMap::new();
        for plan in plans {
            let Some(address) = plan.descriptor.address else {
                continue;
            };
            let selectors: BTreeSet<Selector> = registry
                .entries()
                .filter(|(_, entry)| entry.facet_name == plan.descriptor.name)
                .map(|(selector, _)| *selector)
                .collect();
            let tx_hash = plan.tx_hash.clone().or_else(|| {
                state
                    .deployed_facets
                    .get(&plan.descriptor.name)
                    .and_then(|facet| facet.tx_hash.clone())
            });
            facets.insert(
                plan.descriptor.name.clone(),
                DeployedFacet {
                    address,
                    tx_hash,
                    version: plan.target_version,
                    func_selectors: selectors,
                },
            );
        }
        state.deployed_facets = facets;
    }

    /// Phase 5: per-facet initializers, one step each. The protocol init
    /// facet is excluded since its call rode the cut transaction.
    async fn run_initializers(&self, diamond: Address, plans: &[FacetPlan]) -> Result<()> {
        for plan in plans.iter().filter(|plan| plan.redeployed) {
            let name = &plan.descriptor.name;
            if self.config.protocol_init_facet.as_deref() == Some(name.as_str()) {
                continue;
            }
            let init = if plan.previously_deployed {
                plan.version_config.upgrade_init.as_ref()
            } else {
                plan.version_config.deploy_init.as_ref()
            };
            let Some(signature) = init else {
                continue;
            };
            let signature = cut::normalize_signature(signature);
            let step = init_step_name(name);
            self.run_step(&step, &format!("initialize facet {name}"), || async move {
                let outcome = self.client.send(diamond, &signature, Vec::new()).await?;
                let outcome = StepOutcome {
                    tx_hash: Some(format!("{:?}", outcome.tx_hash)),
                    gas_used: outcome.gas_used,
                    ..StepOutcome::default()
                };
                Ok(((), outcome))
            })
            .await?;
        }
        Ok(())
    }

    /// Phase 6: configured post-deploy callbacks, as one step.
    async fn run_callbacks(
        &self,
        diamond: Address,
        state: &DeployedState,
        plans: &[FacetPlan],
    ) -> Result<()> {
        let pending: Vec<(String, String)> = plans
            .iter()
            .filter(|plan| plan.redeployed)
            .flat_map(|plan| {
                plan.version_config
                    .callbacks
                    .iter()
                    .map(|callback| (plan.descriptor.name.clone(), callback.clone()))
            })
            .collect();

        self.run_step(STEP_CALLBACKS, "run post-deploy callbacks", || async move {
            for (facet, name) in &pending {
                let callback = self.callbacks.get(name).ok_or_else(|| {
                    Error::Configuration(format!("facet {facet} names unknown callback {name:?}"))
                })?;
                info!(callback = %name, facet = %facet, "running post-deploy callback");
                callback
                    .run(CallbackContext {
                        client: self.client.as_ref(),
                        diamond,
                        state,
                    })
                    .await?;
            }
            Ok(((), StepOutcome::default()))
        })
        .await?;
        Ok(())
    }
}

/// Explicit per-deployment instance registry: one deployer per
/// diamond+network+chain key, owned by the caller instead of process-wide
/// state.
#[derive(Default)]
pub struct DeployerFactory {
    deployers: Mutex<BTreeMap<String, Arc<DiamondDeployer>>>,
}

impl DeployerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        id: &DeploymentId,
        build: impl FnOnce() -> Result<DiamondDeployer>,
    ) -> Result<Arc<DiamondDeployer>> {
        let mut deployers = self
            .deployers
            .lock()
            .map_err(|_| Error::Store("deployer factory lock poisoned".into()))?;
        if let Some(deployer) = deployers.get(&id.to_string()) {
            return Ok(deployer.clone());
        }
        let deployer = Arc::new(build()?);
        deployers.insert(id.to_string(), deployer.clone());
        Ok(deployer)
    }
}
