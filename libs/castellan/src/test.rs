use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, TxHash, U256};

use crate::artifacts::{ArtifactResolver, ContractArtifact};
use crate::client::{ChainClient, DeployedContract, TxOutcome};
use crate::config::{
    DeployerSettings, DeploymentId, DiamondConfig, FacetConfig, FacetDescriptor,
    FacetVersionConfig,
};
use crate::cut::{self, CutAction, InitializerCall, DIAMOND_CUT_SIGNATURE};
use crate::deployer::{
    CallbackContext, DeployerFactory, DiamondDeployer, PostDeployCallback, STEP_DEPLOY_PROXY,
    STEP_PERFORM_CUT,
};
use crate::error::{Error, Result};
use crate::record::{DeployedFacet, DeployedState, DeployedStateStore, JsonStateStore};
use crate::reconcile::reconcile;
use crate::registry::{EntryAction, RegistryEntry, SelectorRegistry};
use crate::selector::Selector;
use crate::steps::{DeploymentStep, JsonStepStore, StepOutcome, StepStatus, StepStore};

mod test_utils {
    use super::*;

    pub(super) fn sel(s: &str) -> Selector {
        s.parse().expect("test selector")
    }

    pub(super) fn selector_of(signature: &str) -> Selector {
        Selector::new(ethers::utils::id(signature))
    }

    pub(super) fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    pub(super) fn entry(
        selector: Selector,
        facet: &str,
        address: Address,
        priority: u32,
        action: EntryAction,
    ) -> RegistryEntry {
        RegistryEntry {
            selector,
            facet_name: facet.to_owned(),
            address,
            priority,
            action,
        }
    }

    /// Artifact whose bytecode is the contract name, so the fake client
    /// can report which contract a deploy call was for.
    pub(super) fn artifact(name: &str, functions: &[&str]) -> ContractArtifact {
        let entries: Vec<serde_json::Value> = functions
            .iter()
            .map(|f| {
                serde_json::json!({
                    "type": "function",
                    "name": f,
                    "inputs": [],
                    "outputs": [],
                    "stateMutability": "nonpayable",
                })
            })
            .collect();
        ContractArtifact {
            abi: serde_json::from_value(serde_json::Value::Array(entries)).expect("test abi"),
            bytecode: Bytes::from(name.as_bytes().to_vec()),
        }
    }

    pub(super) struct TestArtifacts {
        inner: Mutex<HashMap<String, ContractArtifact>>,
    }

    impl TestArtifacts {
        pub(super) fn new() -> Self {
            Self {
                inner: Mutex::new(HashMap::new()),
            }
        }

        pub(super) fn insert(&self, name: &str, functions: &[&str]) {
            self.inner
                .lock()
                .unwrap()
                .insert(name.to_owned(), artifact(name, functions));
        }
    }

    impl ArtifactResolver for TestArtifacts {
        fn contract_name(&self, logical: &str) -> Result<String> {
            let inner = self.inner.lock().unwrap();
            if inner.contains_key(logical) {
                return Ok(logical.to_owned());
            }
            let mock = format!("{logical}Mock");
            if inner.contains_key(&mock) {
                return Ok(mock);
            }
            Err(Error::Artifact(format!("no artifact for {logical}")))
        }

        fn artifact(&self, logical: &str) -> Result<ContractArtifact> {
            let name = self.contract_name(logical)?;
            Ok(self.inner.lock().unwrap()[&name].clone())
        }
    }

    /// In-memory chain: deployments get sequential addresses, sends are
    /// recorded verbatim, and `fail_sends` simulates a reverting cut.
    pub(super) struct TestChainClient {
        counter: AtomicU64,
        pub(super) deploys: Mutex<Vec<String>>,
        pub(super) sends: Mutex<Vec<(Address, String, Vec<Token>)>>,
        pub(super) fail_sends: AtomicBool,
    }

    impl TestChainClient {
        pub(super) fn new() -> Self {
            Self {
                counter: AtomicU64::new(0),
                deploys: Mutex::new(Vec::new()),
                sends: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
            }
        }

        pub(super) fn deploy_count(&self) -> usize {
            self.deploys.lock().unwrap().len()
        }

        pub(super) fn send_count(&self) -> usize {
            self.sends.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChainClient for TestChainClient {
        fn sender(&self) -> Address {
            addr(0xd0)
        }

        async fn chain_id(&self) -> Result<u64> {
            Ok(31337)
        }

        async fn check_connectivity(&self) -> Result<()> {
            Ok(())
        }

        async fn deploy(
            &self,
            artifact: &ContractArtifact,
            _constructor_args: Vec<Token>,
        ) -> Result<DeployedContract> {
            // Yield so overlapping deploy() calls actually interleave.
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let name = String::from_utf8(artifact.bytecode.to_vec()).expect("test bytecode");
            self.deploys.lock().unwrap().push(name);
            Ok(DeployedContract {
                address: addr(0x1000 + n),
                tx_hash: TxHash::from_low_u64_be(0x2000 + n),
                gas_used: Some(U256::from(100_000u64)),
            })
        }

        async fn send(&self, to: Address, function: &str, args: Vec<Token>) -> Result<TxOutcome> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::TransactionFailed("simulated revert".into()));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            self.sends
                .lock()
                .unwrap()
                .push((to, function.to_owned(), args));
            Ok(TxOutcome {
                tx_hash: TxHash::from_low_u64_be(0x2000 + n),
                gas_used: Some(U256::from(50_000u64)),
            })
        }

        async fn read(&self, _to: Address, _function: &str, _args: Vec<Token>) -> Result<Vec<Token>> {
            Ok(Vec::new())
        }
    }

    pub(super) struct TestEnv {
        pub(super) client: Arc<TestChainClient>,
        pub(super) artifacts: Arc<TestArtifacts>,
        pub(super) dir: tempfile::TempDir,
        pub(super) id: DeploymentId,
    }

    impl TestEnv {
        pub(super) fn new() -> Self {
            let artifacts = TestArtifacts::new();
            artifacts.insert("Keep", &[]);
            artifacts.insert("treasury", &["deposit", "withdraw", "initTreasury"]);
            artifacts.insert("granary", &["stash"]);
            Self {
                client: Arc::new(TestChainClient::new()),
                artifacts: Arc::new(artifacts),
                dir: tempfile::tempdir().expect("tempdir"),
                id: DeploymentId::new("Keep", "devnet", 31337),
            }
        }

        pub(super) fn deployer(&self, config: DiamondConfig) -> DiamondDeployer {
            let steps = JsonStepStore::open(self.dir.path(), &self.id).expect("step store");
            let states = JsonStateStore::new(self.dir.path());
            DiamondDeployer::new(
                self.id.clone(),
                config,
                self.client.clone(),
                self.artifacts.clone(),
                Arc::new(steps),
                Arc::new(states),
            )
            .expect("deployer")
        }

        pub(super) fn load_state(&self) -> DeployedState {
            JsonStateStore::new(self.dir.path())
                .load(&self.id)
                .expect("state store")
                .expect("deployed state")
        }
    }

    pub(super) fn facet_config(priority: u32, versions: &[(u64, FacetVersionConfig)]) -> FacetConfig {
        FacetConfig {
            priority,
            versions: versions.iter().cloned().collect(),
        }
    }

    /// Keep diamond with a treasury facet (protocol initializer) and a
    /// granary facet, both at version 1.
    pub(super) fn base_config() -> DiamondConfig {
        let mut facets = BTreeMap::new();
        facets.insert(
            "treasury".to_owned(),
            facet_config(
                100,
                &[(
                    1,
                    FacetVersionConfig {
                        deploy_init: Some("initTreasury".into()),
                        ..FacetVersionConfig::default()
                    },
                )],
            ),
        );
        facets.insert(
            "granary".to_owned(),
            facet_config(200, &[(1, FacetVersionConfig::default())]),
        );
        DiamondConfig {
            diamond_name: "Keep".into(),
            protocol_version: 1,
            protocol_init_facet: Some("treasury".into()),
            facets,
        }
    }

    pub(super) struct CountingCallback {
        pub(super) calls: AtomicUsize,
        pub(super) last_diamond: Mutex<Option<Address>>,
    }

    impl CountingCallback {
        pub(super) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last_diamond: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl PostDeployCallback for CountingCallback {
        async fn run(&self, ctx: CallbackContext<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_diamond.lock().unwrap() = Some(ctx.diamond);
            Ok(())
        }
    }
}

mod unit_tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn registry_round_trip() {
        let mut registry = SelectorRegistry::new();
        let s = sel("0xaabbccdd");
        let e = entry(s, "treasury", addr(1), 100, EntryAction::Deployed);
        registry.register([e.clone()]);

        assert!(registry.is_registered(&s));
        assert_eq!(registry.get(&s), Some(&e));
        assert!(!registry.is_registered(&sel("0x00000000")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn priority_precedence_is_order_independent() {
        let shared = sel("0xaaaaaaaa");
        let a = FacetDescriptor::new("a", 10, [shared].into()).with_address(addr(1));
        let b = FacetDescriptor::new("b", 20, [shared].into()).with_address(addr(2));
        let configured: BTreeSet<String> = ["a".to_owned(), "b".to_owned()].into();

        // Declaration order must not matter; the engine sorts by priority.
        for facets in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
            let mut registry = SelectorRegistry::new();
            reconcile(&mut registry, &facets, &configured).unwrap();
            let owner = registry.get(&shared).unwrap();
            assert_eq!(owner.facet_name, "a");
            assert_eq!(owner.action, EntryAction::Add);
            assert_eq!(owner.address, addr(1));
        }
    }

    #[test]
    fn include_override_beats_lower_precedence() {
        let s = sel("0xbbbbbbbb");
        let mut registry = SelectorRegistry::new();
        registry.register([entry(s, "b", addr(2), 20, EntryAction::Deployed)]);

        let a = FacetDescriptor::new("a", 10, BTreeSet::new())
            .with_address(addr(1))
            .with_includes([s].into());
        let configured: BTreeSet<String> = ["a".to_owned(), "b".to_owned()].into();
        reconcile(&mut registry, &[a], &configured).unwrap();

        let owner = registry.get(&s).unwrap();
        assert_eq!(owner.facet_name, "a");
        assert_eq!(owner.action, EntryAction::Replace);
    }

    #[test]
    fn include_override_of_unowned_selector_is_add() {
        let s = sel("0xcccccccc");
        let mut registry = SelectorRegistry::new();
        let a = FacetDescriptor::new("a", 10, BTreeSet::new())
            .with_address(addr(1))
            .with_includes([s].into());
        reconcile(&mut registry, &[a], &["a".to_owned()].into()).unwrap();

        assert_eq!(registry.get(&s).unwrap().action, EntryAction::Add);
    }

    #[test]
    fn exclude_removes_self_ownership_only() {
        let mine = sel("0x11111111");
        let theirs = sel("0x22222222");
        let mut registry = SelectorRegistry::new();
        registry.register([
            entry(mine, "a", addr(1), 10, EntryAction::Deployed),
            entry(theirs, "b", addr(2), 20, EntryAction::Deployed),
        ]);

        let a = FacetDescriptor::new("a", 10, [mine].into())
            .with_address(addr(1))
            .with_excludes([mine, theirs].into());
        let configured: BTreeSet<String> = ["a".to_owned(), "b".to_owned()].into();
        reconcile(&mut registry, &[a], &configured).unwrap();

        assert_eq!(registry.get(&mine).unwrap().action, EntryAction::Remove);
        // Excluding a selector another facet owns is a no-op.
        let other = registry.get(&theirs).unwrap();
        assert_eq!(other.facet_name, "b");
        assert_eq!(other.action, EntryAction::Deployed);
    }

    #[test]
    fn redeploy_refreshes_address_and_drops_stale_selectors() {
        let kept = sel("0x11111111");
        let dropped = sel("0x22222222");
        let mut registry = SelectorRegistry::new();
        registry.register([
            entry(kept, "a", addr(1), 10, EntryAction::Deployed),
            entry(dropped, "a", addr(1), 10, EntryAction::Deployed),
        ]);

        // Redeployed at a new address, no longer implementing `dropped`.
        let a = FacetDescriptor::new("a", 10, [kept].into()).with_address(addr(9));
        reconcile(&mut registry, &[a], &["a".to_owned()].into()).unwrap();

        let refreshed = registry.get(&kept).unwrap();
        assert_eq!(refreshed.action, EntryAction::Replace);
        assert_eq!(refreshed.address, addr(9));
        assert_eq!(registry.get(&dropped).unwrap().action, EntryAction::Remove);
    }

    #[test]
    fn weaker_facet_does_not_steal_selector() {
        let s = sel("0x33333333");
        let mut registry = SelectorRegistry::new();
        registry.register([entry(s, "a", addr(1), 10, EntryAction::Deployed)]);

        let b = FacetDescriptor::new("b", 20, [s].into()).with_address(addr(2));
        let configured: BTreeSet<String> = ["a".to_owned(), "b".to_owned()].into();
        reconcile(&mut registry, &[b], &configured).unwrap();

        let owner = registry.get(&s).unwrap();
        assert_eq!(owner.facet_name, "a");
        assert_eq!(owner.action, EntryAction::Deployed);
    }

    #[test]
    fn decommissioned_facet_is_fully_removed() {
        let s1 = sel("0x11111111");
        let s2 = sel("0x22222222");
        let mut registry = SelectorRegistry::new();
        registry.register([
            entry(s1, "legacy", addr(1), 1000, EntryAction::Deployed),
            entry(s2, "legacy", addr(1), 1000, EntryAction::Deployed),
        ]);

        reconcile(&mut registry, &[], &["treasury".to_owned()].into()).unwrap();

        assert_eq!(registry.get(&s1).unwrap().action, EntryAction::Remove);
        assert_eq!(registry.get(&s2).unwrap().action, EntryAction::Remove);
    }

    #[test]
    fn orphan_detection_aborts_compilation() {
        let mut registry = SelectorRegistry::new();
        registry.register([
            entry(sel("0x11111111"), "x", addr(1), 100, EntryAction::Add),
            entry(sel("0x22222222"), "x", addr(2), 100, EntryAction::Add),
        ]);

        let err = cut::compile_plan(&registry, InitializerCall::noop()).unwrap_err();
        match err {
            Error::OrphanedSelectors { facet, .. } => assert_eq!(facet, "x"),
            other => panic!("expected orphaned selectors, got {other}"),
        }
    }

    #[test]
    fn deployed_only_registry_compiles_to_empty_plan() {
        let mut registry = SelectorRegistry::new();
        registry.register([
            entry(sel("0x11111111"), "a", addr(1), 100, EntryAction::Deployed),
            entry(sel("0x22222222"), "b", addr(2), 200, EntryAction::Deployed),
        ]);

        let plan = cut::compile_plan(&registry, InitializerCall::noop()).unwrap();
        assert!(plan.operations.is_empty());
        assert!(plan.is_noop());
    }

    #[test]
    fn cut_groups_per_facet_action_and_address() {
        let mut registry = SelectorRegistry::new();
        registry.register([
            entry(sel("0x22222222"), "x", addr(1), 100, EntryAction::Add),
            entry(sel("0x11111111"), "x", addr(1), 100, EntryAction::Add),
            entry(sel("0x33333333"), "y", addr(2), 200, EntryAction::Remove),
        ]);

        let plan = cut::compile_plan(&registry, InitializerCall::noop()).unwrap();
        assert_eq!(plan.operations.len(), 2);

        let add = &plan.operations[0];
        assert_eq!(add.facet_name, "x");
        assert_eq!(add.action, CutAction::Add);
        assert_eq!(add.selectors, vec![sel("0x11111111"), sel("0x22222222")]);

        let remove = &plan.operations[1];
        assert_eq!(remove.action, CutAction::Remove);
        assert_eq!(remove.facet_address, Address::zero());
    }

    #[test]
    fn initializer_resolves_the_protocol_init_call() {
        let config = base_config();
        let addresses: BTreeMap<String, Address> = [("treasury".to_owned(), addr(7))].into();

        let mut state = DeployedState::default();
        let fresh = cut::resolve_initializer(&config, &state, &addresses, true).unwrap();
        assert_eq!(fresh.address, addr(7));
        assert_eq!(
            fresh.calldata.to_vec(),
            selector_of("initTreasury()").as_bytes().to_vec()
        );

        // Recorded version already current: no-op initializer.
        state.protocol_version = 1;
        let noop = cut::resolve_initializer(&config, &state, &addresses, true).unwrap();
        assert!(noop.is_noop());
    }

    #[test]
    fn init_signature_must_be_argless() {
        assert!(cut::encode_init_call("init").is_ok());
        assert!(cut::encode_init_call("init()").is_ok());
        assert!(cut::encode_init_call("init(address)").is_err());
    }

    #[test]
    fn config_parses_external_shape() {
        let raw = r#"{
            "diamondName": "Keep",
            "protocolVersion": 2,
            "protocolInitFacet": "treasury",
            "facets": {
                "treasury": {
                    "priority": 100,
                    "versions": {
                        "2": {
                            "upgradeInit": "migrate",
                            "deployExclude": ["0x11111111"],
                            "callbacks": ["announce"]
                        }
                    }
                },
                "granary": {}
            }
        }"#;
        let config: DiamondConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.protocol_version, 2);
        let treasury = &config.facets["treasury"];
        assert_eq!(treasury.target_version(), 2);
        assert_eq!(
            treasury.version_config().unwrap().exclude_overrides().unwrap(),
            [sel("0x11111111")].into()
        );
        // Unconfigured priority falls back to the default.
        assert_eq!(config.facets["granary"].priority, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn config_rejects_unknown_init_facet() {
        let mut config = base_config();
        config.protocol_init_facet = Some("ghost".into());
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn settings_bounds_are_enforced() {
        let good = DeployerSettings {
            rpc_url: "http://localhost:8547".into(),
            private_key: format!("0x{}", "11".repeat(32)),
            network_name: "devnet".into(),
            gas_multiplier: 1.2,
            max_retries: 3,
            retry_base_delay: std::time::Duration::from_millis(500),
            retry_jitter: false,
        };
        good.validate().unwrap();

        let mut bad = good.clone();
        bad.gas_multiplier = 2.5;
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.max_retries = 0;
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.retry_base_delay = std::time::Duration::from_millis(50);
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.rpc_url = "ftp://localhost".into();
        assert!(bad.validate().is_err());

        let mut bad = good;
        bad.private_key = "0x1234".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn deployment_id_lowercases_names() {
        let id = DeploymentId::new("MyKeep", "Sepolia", 11155111);
        assert_eq!(id.to_string(), "mykeep-sepolia-11155111");
    }

    #[test]
    fn step_store_round_trips_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let id = DeploymentId::new("Keep", "devnet", 31337);

        let store = JsonStepStore::open(dir.path(), &id).unwrap();
        store
            .save_step(DeploymentStep::pending("deploy-facet-treasury", "deploy"))
            .unwrap();
        assert!(!store.is_step_completed("deploy-facet-treasury").unwrap());
        store
            .update_status(
                "deploy-facet-treasury",
                StepStatus::Completed,
                StepOutcome {
                    contract_address: Some(addr(5)),
                    tx_hash: Some("0xabc".into()),
                    ..StepOutcome::default()
                },
            )
            .unwrap();

        // An unfinished run survives a restart with its steps intact.
        let resumed = JsonStepStore::open(dir.path(), &id).unwrap();
        assert!(resumed.is_step_completed("deploy-facet-treasury").unwrap());
        let step = resumed.get_step("deploy-facet-treasury").unwrap().unwrap();
        assert_eq!(step.contract_address, Some(addr(5)));

        // A completed run starts the next invocation from scratch.
        resumed.mark_deployment_complete().unwrap();
        let fresh = JsonStepStore::open(dir.path(), &id).unwrap();
        assert!(!fresh.is_step_completed("deploy-facet-treasury").unwrap());
    }

    #[test]
    fn step_store_rejects_status_update_for_unknown_step() {
        let dir = tempfile::tempdir().unwrap();
        let id = DeploymentId::new("Keep", "devnet", 31337);
        let store = JsonStepStore::open(dir.path(), &id).unwrap();
        assert!(store
            .update_status("ghost", StepStatus::Completed, StepOutcome::default())
            .is_err());
    }

    #[test]
    fn state_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let id = DeploymentId::new("Keep", "devnet", 31337);
        let store = JsonStateStore::new(dir.path());
        assert!(store.load(&id).unwrap().is_none());

        let mut state = DeployedState::default();
        state.diamond_address = Some(addr(1));
        state.protocol_version = 3;
        state.deployed_facets.insert(
            "treasury".into(),
            DeployedFacet {
                address: addr(2),
                tx_hash: Some("0xfeed".into()),
                version: 3,
                func_selectors: [sel("0x11111111")].into(),
            },
        );
        store.save(&id, &state).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(state));
    }

    #[test]
    fn artifact_resolver_falls_back_to_mock_name() {
        let dir = tempfile::tempdir().unwrap();
        let raw = serde_json::json!({
            "abi": [],
            "bytecode": "0x6080",
        });
        std::fs::write(
            dir.path().join("VaultMock.json"),
            serde_json::to_string(&raw).unwrap(),
        )
        .unwrap();

        let resolver = crate::artifacts::DirArtifactResolver::new(dir.path());
        assert_eq!(resolver.contract_name("Vault").unwrap(), "VaultMock");
        assert_eq!(
            resolver.artifact("Vault").unwrap().bytecode.to_vec(),
            vec![0x60, 0x80]
        );
        assert!(resolver.contract_name("Ghost").is_err());
    }

    #[tokio::test]
    async fn retry_exhausts_exactly_the_configured_attempts() {
        let policy =
            crate::retry::RetryPolicy::new(3, std::time::Duration::from_millis(100), false)
                .unwrap();
        let attempts = AtomicUsize::new(0);

        let err = policy
            .run("connectivity check", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Connection("refused".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("3 attempts"), "{err}");
    }

    #[tokio::test]
    async fn retry_never_touches_non_transient_errors() {
        let policy =
            crate::retry::RetryPolicy::new(5, std::time::Duration::from_millis(100), false)
                .unwrap();
        let attempts = AtomicUsize::new(0);

        let err = policy
            .run("cut", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::TransactionFailed("reverted".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::TransactionFailed(_)));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let policy =
            crate::retry::RetryPolicy::new(5, std::time::Duration::from_millis(100), true)
                .unwrap();
        let attempts = AtomicUsize::new(0);

        let value = policy
            .run("gas estimate", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::GasEstimation("node lagging".into()))
                    } else {
                        Ok(42u64)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_policy_rejects_out_of_bounds_tunables() {
        use std::time::Duration;
        assert!(crate::retry::RetryPolicy::new(0, Duration::from_secs(1), false).is_err());
        assert!(crate::retry::RetryPolicy::new(11, Duration::from_secs(1), false).is_err());
        assert!(crate::retry::RetryPolicy::new(3, Duration::from_millis(10), false).is_err());
        assert!(crate::retry::RetryPolicy::new(3, Duration::from_secs(60), false).is_err());
    }
}

mod test_scenarios {
    use super::test_utils::*;
    use super::*;

    #[tokio::test]
    async fn fresh_deployment_runs_every_phase() {
        let env = TestEnv::new();
        let deployer = env.deployer(base_config());
        let state = deployer.deploy().await.unwrap();

        // Proxy first, then facets in ascending priority order.
        assert_eq!(
            *env.client.deploys.lock().unwrap(),
            vec!["Keep".to_owned(), "treasury".to_owned(), "granary".to_owned()]
        );

        let diamond = state.diamond_address.unwrap();
        assert_eq!(state.deployer_address, Some(addr(0xd0)));
        assert_eq!(state.protocol_version, 1);

        let treasury = &state.deployed_facets["treasury"];
        assert_eq!(treasury.version, 1);
        assert_eq!(
            treasury.func_selectors,
            ["deposit()", "withdraw()", "initTreasury()"]
                .map(selector_of)
                .into()
        );
        assert_eq!(
            state.deployed_facets["granary"].func_selectors,
            [selector_of("stash()")].into()
        );

        // One cut transaction, carrying the protocol initializer.
        let sends = env.client.sends.lock().unwrap();
        assert_eq!(sends.len(), 1);
        let (to, function, args) = &sends[0];
        assert_eq!(*to, diamond);
        assert_eq!(function, DIAMOND_CUT_SIGNATURE);
        let Token::Array(operations) = &args[0] else {
            panic!("expected operations array");
        };
        assert_eq!(operations.len(), 2);
        assert_eq!(args[1], Token::Address(treasury.address));
        assert_eq!(
            args[2],
            Token::Bytes(selector_of("initTreasury()").as_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let env = TestEnv::new();
        env.deployer(base_config()).deploy().await.unwrap();
        let before = env.load_state();

        let state = env.deployer(base_config()).deploy().await.unwrap();

        assert_eq!(state, before);
        assert_eq!(env.client.deploy_count(), 3);
        assert_eq!(env.client.send_count(), 1);
    }

    #[tokio::test]
    async fn resume_skips_completed_deployments() {
        let env = TestEnv::new();
        env.client.fail_sends.store(true, Ordering::SeqCst);

        let err = env.deployer(base_config()).deploy().await.unwrap_err();
        assert!(matches!(err, Error::TransactionFailed(_)));
        assert_eq!(env.client.deploy_count(), 3);
        assert_eq!(env.client.send_count(), 0);

        // The failed cut left its checkpoint behind; re-running must not
        // redeploy the proxy or any facet.
        env.client.fail_sends.store(false, Ordering::SeqCst);
        let deployer = env.deployer(base_config());
        assert!(deployer
            .deployment_id()
            .to_string()
            .starts_with("keep-devnet"));
        let state = deployer.deploy().await.unwrap();

        assert_eq!(env.client.deploy_count(), 3);
        assert_eq!(env.client.send_count(), 1);
        assert!(state.diamond_address.is_some());
        assert_eq!(state.deployed_facets.len(), 2);
    }

    #[tokio::test]
    async fn upgrade_redeploys_only_the_bumped_facet() {
        let env = TestEnv::new();
        env.deployer(base_config()).deploy().await.unwrap();
        let old_treasury = env.load_state().deployed_facets["treasury"].address;

        // Treasury v2 grows a selector; granary stays at v1.
        env.artifacts
            .insert("treasury", &["deposit", "withdraw", "initTreasury", "sweep"]);
        let mut config = base_config();
        let treasury = config.facets.get_mut("treasury").unwrap();
        treasury.versions.insert(
            2,
            FacetVersionConfig {
                upgrade_init: Some("migrateTreasury".into()),
                ..FacetVersionConfig::default()
            },
        );
        config.protocol_version = 2;

        let state = env.deployer(config).deploy().await.unwrap();

        assert_eq!(
            *env.client.deploys.lock().unwrap(),
            vec![
                "Keep".to_owned(),
                "treasury".to_owned(),
                "granary".to_owned(),
                "treasury".to_owned(),
            ]
        );
        let treasury = &state.deployed_facets["treasury"];
        assert_ne!(treasury.address, old_treasury);
        assert_eq!(treasury.version, 2);
        assert_eq!(treasury.func_selectors.len(), 4);
        assert_eq!(state.deployed_facets["granary"].version, 1);
        assert_eq!(state.protocol_version, 2);

        // Second cut carries the upgrade initializer.
        let sends = env.client.sends.lock().unwrap();
        assert_eq!(sends.len(), 2);
        let (_, _, args) = &sends[1];
        assert_eq!(args[1], Token::Address(treasury.address));
        assert_eq!(
            args[2],
            Token::Bytes(selector_of("migrateTreasury()").as_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn facet_initializer_runs_as_its_own_transaction() {
        let env = TestEnv::new();
        env.deployer(base_config()).deploy().await.unwrap();

        // Granary v2 carries an upgrade initializer; granary is not the
        // protocol init facet, so the call must go out as a separate
        // transaction after the cut.
        let mut config = base_config();
        let granary = config.facets.get_mut("granary").unwrap();
        granary.versions.insert(
            2,
            FacetVersionConfig {
                upgrade_init: Some("restock".into()),
                ..FacetVersionConfig::default()
            },
        );

        let state = env.deployer(config).deploy().await.unwrap();
        let diamond = state.diamond_address.unwrap();

        let sends = env.client.sends.lock().unwrap();
        assert_eq!(sends.len(), 3);
        assert_eq!(sends[1].1, DIAMOND_CUT_SIGNATURE);
        let (to, function, args) = &sends[2];
        assert_eq!(*to, diamond);
        assert_eq!(function, "restock()");
        assert!(args.is_empty());
    }

    #[tokio::test]
    async fn dropping_a_facet_from_config_decommissions_it() {
        let env = TestEnv::new();
        env.deployer(base_config()).deploy().await.unwrap();

        let mut config = base_config();
        config.facets.remove("granary");
        let state = env.deployer(config).deploy().await.unwrap();

        assert!(!state.deployed_facets.contains_key("granary"));
        assert_eq!(env.client.deploy_count(), 3);

        let sends = env.client.sends.lock().unwrap();
        assert_eq!(sends.len(), 2);
        let (_, _, args) = &sends[1];
        let Token::Array(operations) = &args[0] else {
            panic!("expected operations array");
        };
        assert_eq!(operations.len(), 1);
        let Token::Tuple(op) = &operations[0] else {
            panic!("expected cut tuple");
        };
        assert_eq!(op[0], Token::Address(Address::zero()));
        assert_eq!(op[1], Token::Uint((CutAction::Remove as u8).into()));
    }

    #[tokio::test]
    async fn exclude_override_keeps_selector_out_of_the_cut() {
        let env = TestEnv::new();
        let mut config = base_config();
        let treasury = config.facets.get_mut("treasury").unwrap();
        let version = treasury.versions.get_mut(&1).unwrap();
        version.deploy_exclude = vec![selector_of("withdraw()").to_string()];

        let state = env.deployer(config).deploy().await.unwrap();

        let selectors = &state.deployed_facets["treasury"].func_selectors;
        assert!(selectors.contains(&selector_of("deposit()")));
        assert!(!selectors.contains(&selector_of("withdraw()")));
    }

    #[tokio::test]
    async fn overlapping_deploy_calls_share_one_run() {
        let env = TestEnv::new();
        let deployer = env.deployer(base_config());

        let (first, second) = tokio::join!(deployer.deploy(), deployer.deploy());
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(first, second);
        assert_eq!(env.client.deploy_count(), 3);
        assert_eq!(env.client.send_count(), 1);
    }

    #[tokio::test]
    async fn post_deploy_callbacks_run_once_with_the_diamond() {
        let env = TestEnv::new();
        let mut config = base_config();
        let treasury = config.facets.get_mut("treasury").unwrap();
        treasury.versions.get_mut(&1).unwrap().callbacks = vec!["announce".into()];

        let callback = Arc::new(CountingCallback::new());
        let mut deployer = env.deployer(config);
        deployer.register_callback("announce", callback.clone());

        let state = deployer.deploy().await.unwrap();

        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *callback.last_diamond.lock().unwrap(),
            state.diamond_address
        );
    }

    #[tokio::test]
    async fn unknown_callback_name_fails_the_run() {
        let env = TestEnv::new();
        let mut config = base_config();
        let treasury = config.facets.get_mut("treasury").unwrap();
        treasury.versions.get_mut(&1).unwrap().callbacks = vec!["missing".into()];

        let err = env.deployer(config).deploy().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn completed_steps_survive_until_the_run_finishes() {
        let env = TestEnv::new();
        env.client.fail_sends.store(true, Ordering::SeqCst);
        env.deployer(base_config()).deploy().await.unwrap_err();

        let steps = JsonStepStore::open(env.dir.path(), &env.id).unwrap();
        assert!(steps.is_step_completed(STEP_DEPLOY_PROXY).unwrap());
        assert!(steps.is_step_completed("deploy-facet-treasury").unwrap());
        assert!(!steps.is_step_completed(STEP_PERFORM_CUT).unwrap());
        let failed = steps.get_step(STEP_PERFORM_CUT).unwrap().unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed.error.as_deref().unwrap_or("").contains("revert"));
    }

    #[tokio::test]
    async fn factory_reuses_one_deployer_per_deployment_id() {
        let env = TestEnv::new();
        let factory = DeployerFactory::new();

        let first = factory
            .get_or_create(&env.id, || Ok(env.deployer(base_config())))
            .unwrap();
        let second = factory
            .get_or_create(&env.id, || panic!("must reuse the cached deployer"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }
}
