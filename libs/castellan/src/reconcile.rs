//! Selector-ownership reconciliation.
//!
//! Consumes the registry (previously deployed state) plus the facets
//! (re)deployed this run and decides, per selector, whether the cut must
//! Add, Replace, or Remove. Purely local: no network I/O, and the outcome
//! is a function of the inputs alone. Facets are processed in ascending
//! priority-number order (most precedent first) and selectors in lexical
//! order; that ordering is part of the contract, not an accident.

use std::collections::{BTreeMap, BTreeSet};

use ethers::types::Address;

use crate::config::FacetDescriptor;
use crate::error::{Error, Result};
use crate::registry::{EntryAction, RegistryEntry, SelectorRegistry};
use crate::selector::Selector;

/// Runs every pass for every deployed facet, then drops facets no longer
/// configured. `configured` is the full set of facet names in the current
/// configuration, including facets that did not need redeployment.
pub fn reconcile(
    registry: &mut SelectorRegistry,
    deployed: &[FacetDescriptor],
    configured: &BTreeSet<String>,
) -> Result<()> {
    let mut facets: Vec<&FacetDescriptor> = deployed.iter().collect();
    facets.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));

    for facet in facets {
        let address = facet.address.ok_or_else(|| {
            Error::Configuration(format!(
                "facet {} reached reconciliation without a deployed address",
                facet.name
            ))
        })?;

        let mut working = facet.selectors.clone();
        apply_exclusions(registry, facet, &mut working);
        let snapshot = lower_precedence_snapshot(registry, facet.priority);
        apply_include_overrides(registry, facet, address, &snapshot, &mut working);
        apply_ownership(registry, facet, address, &working);
        drop_stale_addresses(registry, facet, address);
    }

    drop_decommissioned(registry, configured);
    Ok(())
}

/// Pass 1: excluded selectors leave the facet's own set, and any registry
/// entry this facet holds for them is marked for removal. Exclusions never
/// touch selectors owned by other facets.
pub(crate) fn apply_exclusions(
    registry: &mut SelectorRegistry,
    facet: &FacetDescriptor,
    working: &mut BTreeSet<Selector>,
) {
    for selector in &facet.exclude_overrides {
        working.remove(selector);
        if let Some(entry) = registry.get(selector) {
            if entry.facet_name == facet.name {
                let mut entry = entry.clone();
                entry.action = EntryAction::Remove;
                registry.update(*selector, entry);
            }
        }
    }
}

/// Pass 2: entries whose priority number is strictly greater than the
/// current facet's, i.e. every facet this one outranks. Only the include
/// override pass consults this.
pub(crate) fn lower_precedence_snapshot(
    registry: &SelectorRegistry,
    priority: u32,
) -> BTreeMap<Selector, RegistryEntry> {
    registry
        .entries()
        .filter(|(_, entry)| entry.priority > priority)
        .map(|(selector, entry)| (*selector, entry.clone()))
        .collect()
}

/// Pass 3: include overrides claim their selectors unconditionally: a
/// Replace when the snapshot shows another, outranked facet holding the
/// selector, an Add otherwise. Claimed selectors skip the ownership pass.
pub(crate) fn apply_include_overrides(
    registry: &mut SelectorRegistry,
    facet: &FacetDescriptor,
    address: Address,
    snapshot: &BTreeMap<Selector, RegistryEntry>,
    working: &mut BTreeSet<Selector>,
) {
    for selector in &facet.include_overrides {
        working.remove(selector);
        let action = match snapshot.get(selector) {
            Some(owner) if owner.facet_name != facet.name => EntryAction::Replace,
            _ => EntryAction::Add,
        };
        registry.update(
            *selector,
            RegistryEntry {
                selector: *selector,
                facet_name: facet.name.clone(),
                address,
                priority: facet.priority,
                action,
            },
        );
    }
}

/// Pass 4: the facet's remaining selectors. Unowned selectors are added;
/// self-owned ones are replaced (address refresh); selectors owned by a
/// facet with a strictly lower priority number stay put; the weaker facet
/// silently loses them.
pub(crate) fn apply_ownership(
    registry: &mut SelectorRegistry,
    facet: &FacetDescriptor,
    address: Address,
    working: &BTreeSet<Selector>,
) {
    for selector in working {
        let action = match registry.get(selector) {
            None => EntryAction::Add,
            Some(owner) if owner.facet_name == facet.name => EntryAction::Replace,
            Some(owner) if facet.priority < owner.priority => EntryAction::Replace,
            Some(_) => continue,
        };
        registry.update(
            *selector,
            RegistryEntry {
                selector: *selector,
                facet_name: facet.name.clone(),
                address,
                priority: facet.priority,
                action,
            },
        );
    }
}

/// Pass 5: entries still attributed to this facet at an address other than
/// the freshly deployed one are selectors the redeploy orphaned.
pub(crate) fn drop_stale_addresses(
    registry: &mut SelectorRegistry,
    facet: &FacetDescriptor,
    address: Address,
) {
    let stale: Vec<(Selector, RegistryEntry)> = registry
        .entries()
        .filter(|(_, entry)| entry.facet_name == facet.name && entry.address != address)
        .map(|(selector, entry)| (*selector, entry.clone()))
        .collect();
    for (selector, mut entry) in stale {
        entry.action = EntryAction::Remove;
        registry.update(selector, entry);
    }
}

/// Final pass: every entry held by a facet name absent from the current
/// configuration is decommissioned.
pub(crate) fn drop_decommissioned(registry: &mut SelectorRegistry, configured: &BTreeSet<String>) {
    let decommissioned: Vec<(Selector, RegistryEntry)> = registry
        .entries()
        .filter(|(_, entry)| !configured.contains(&entry.facet_name))
        .map(|(selector, entry)| (*selector, entry.clone()))
        .collect();
    for (selector, mut entry) in decommissioned {
        entry.action = EntryAction::Remove;
        registry.update(selector, entry);
    }
}
