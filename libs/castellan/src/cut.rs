use std::collections::BTreeMap;

use ethers::abi::{HumanReadableParser, Token};
use ethers::types::{Address, Bytes};

use crate::config::DiamondConfig;
use crate::error::{Error, Result};
use crate::record::DeployedState;
use crate::registry::{EntryAction, SelectorRegistry};
use crate::selector::Selector;

pub const DIAMOND_CUT_SIGNATURE: &str = "diamondCut((address,uint8,bytes4[])[],address,bytes)";

/// On-chain action codes of a cut operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CutAction {
    Add = 0,
    Replace = 1,
    Remove = 2,
}

/// One batch entry of the `diamondCut` call. Derived from the registry,
/// never persisted on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct CutOperation {
    pub facet_address: Address,
    pub action: CutAction,
    pub selectors: Vec<Selector>,
    pub facet_name: String,
}

/// The single initializer delegatecalled by the proxy as part of the cut.
#[derive(Debug, Clone, PartialEq)]
pub struct InitializerCall {
    pub address: Address,
    pub calldata: Bytes,
}

impl InitializerCall {
    pub fn noop() -> Self {
        Self {
            address: Address::zero(),
            calldata: Bytes::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.address.is_zero() && self.calldata.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CutPlan {
    pub operations: Vec<CutOperation>,
    pub initializer: InitializerCall,
}

impl CutPlan {
    pub fn is_noop(&self) -> bool {
        self.operations.is_empty() && self.initializer.is_noop()
    }
}

/// Projects the reconciled registry into an ordered cut plan.
///
/// Orphan validation runs first, over every entry including the untouched
/// `Deployed` ones: one logical facet resolving to two addresses means the
/// reconciliation produced an inconsistent target and nothing may be
/// submitted. Pending entries are then grouped per facet, action and
/// address, with selectors kept in lexical order; removals travel with the
/// zero address on the wire.
pub fn compile_plan(registry: &SelectorRegistry, initializer: InitializerCall) -> Result<CutPlan> {
    validate_orphans(registry)?;

    let mut grouped: BTreeMap<(String, CutAction, Address), Vec<Selector>> = BTreeMap::new();
    for (selector, entry) in registry.entries() {
        let action = match entry.action {
            EntryAction::Deployed => continue,
            EntryAction::Add => CutAction::Add,
            EntryAction::Replace => CutAction::Replace,
            EntryAction::Remove => CutAction::Remove,
        };
        let address = match action {
            CutAction::Remove => Address::zero(),
            _ => entry.address,
        };
        grouped
            .entry((entry.facet_name.clone(), action, address))
            .or_default()
            .push(*selector);
    }

    let operations = grouped
        .into_iter()
        .map(|((facet_name, action, facet_address), selectors)| CutOperation {
            facet_address,
            action,
            selectors,
            facet_name,
        })
        .collect();

    Ok(CutPlan {
        operations,
        initializer,
    })
}

fn validate_orphans(registry: &SelectorRegistry) -> Result<()> {
    let mut seen: BTreeMap<String, Address> = BTreeMap::new();
    for (_, entry) in registry.entries() {
        if !matches!(
            entry.action,
            EntryAction::Add | EntryAction::Replace | EntryAction::Deployed
        ) {
            continue;
        }
        match seen.get(&entry.facet_name) {
            Some(address) if *address != entry.address => {
                return Err(Error::OrphanedSelectors {
                    facet: entry.facet_name.clone(),
                    first: *address,
                    second: entry.address,
                });
            }
            Some(_) => {}
            None => {
                seen.insert(entry.facet_name.clone(), entry.address);
            }
        }
    }
    Ok(())
}

/// ABI tokens for `diamondCut((address,uint8,bytes4[])[],address,bytes)`.
pub fn cut_call_args(plan: &CutPlan) -> Vec<Token> {
    let operations = plan
        .operations
        .iter()
        .map(|op| {
            Token::Tuple(vec![
                Token::Address(op.facet_address),
                Token::Uint((op.action as u8).into()),
                Token::Array(
                    op.selectors
                        .iter()
                        .map(|s| Token::FixedBytes(s.as_bytes().to_vec()))
                        .collect(),
                ),
            ])
        })
        .collect();
    vec![
        Token::Array(operations),
        Token::Address(plan.initializer.address),
        Token::Bytes(plan.initializer.calldata.to_vec()),
    ]
}

/// Resolves the protocol initializer: when the configured protocol version
/// exceeds the recorded one, the configured init facet's init function is
/// encoded into a single delegatecall; otherwise the cut runs with the
/// no-op initializer.
pub fn resolve_initializer(
    config: &DiamondConfig,
    state: &DeployedState,
    facet_addresses: &BTreeMap<String, Address>,
    fresh_deployment: bool,
) -> Result<InitializerCall> {
    if config.protocol_version <= state.protocol_version {
        return Ok(InitializerCall::noop());
    }
    let Some(name) = &config.protocol_init_facet else {
        return Ok(InitializerCall::noop());
    };
    let facet = config.facets.get(name).ok_or_else(|| {
        Error::Configuration(format!("protocolInitFacet {name:?} is not a configured facet"))
    })?;
    let version = facet.version_config().ok_or_else(|| {
        Error::Configuration(format!("protocol init facet {name} declares no versions"))
    })?;
    let init = if fresh_deployment {
        version.deploy_init.as_ref()
    } else {
        version.upgrade_init.as_ref()
    };
    let signature = init.ok_or_else(|| {
        Error::Configuration(format!(
            "protocol init facet {name} has no init function for this transition"
        ))
    })?;
    let address = facet_addresses.get(name).ok_or_else(|| {
        Error::Configuration(format!("protocol init facet {name} has no deployed address"))
    })?;
    Ok(InitializerCall {
        address: *address,
        calldata: encode_init_call(signature)?,
    })
}

/// Accepts `init` or `init()`; the function must take no arguments.
pub fn encode_init_call(signature: &str) -> Result<Bytes> {
    let signature = normalize_signature(signature);
    let function = HumanReadableParser::parse_function(&signature)
        .map_err(|e| Error::Configuration(format!("invalid init function {signature:?}: {e}")))?;
    if !function.inputs.is_empty() {
        return Err(Error::Configuration(format!(
            "init function {signature:?} must not take arguments"
        )));
    }
    let data = function
        .encode_input(&[])
        .map_err(|e| Error::Configuration(format!("cannot encode {signature:?}: {e}")))?;
    Ok(Bytes::from(data))
}

pub fn normalize_signature(signature: &str) -> String {
    if signature.contains('(') {
        signature.to_owned()
    } else {
        format!("{signature}()")
    }
}
