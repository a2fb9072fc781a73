use std::collections::BTreeMap;

use ethers::types::Address;

use crate::record::DeployedState;
use crate::selector::Selector;

/// Pending or settled fate of one selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    /// Live on-chain and unchanged this run.
    Deployed,
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub selector: Selector,
    pub facet_name: String,
    pub address: Address,
    pub priority: u32,
    pub action: EntryAction,
}

/// Selector ownership map for one diamond session.
///
/// Rebuilt from the deployed-state record at session start; the map key
/// enforces the one-entry-per-selector invariant. All mutations are total.
#[derive(Debug, Clone, Default)]
pub struct SelectorRegistry {
    entries: BTreeMap<Selector, RegistryEntry>,
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the registry from the record written after the last confirmed
    /// cut: every recorded selector starts as `Deployed`.
    pub fn seeded(state: &DeployedState, priority_of: impl Fn(&str) -> u32) -> Self {
        let mut registry = Self::new();
        for (name, facet) in &state.deployed_facets {
            let priority = priority_of(name);
            registry.register(facet.func_selectors.iter().map(|selector| RegistryEntry {
                selector: *selector,
                facet_name: name.clone(),
                address: facet.address,
                priority,
                action: EntryAction::Deployed,
            }));
        }
        registry
    }

    pub fn register(&mut self, entries: impl IntoIterator<Item = RegistryEntry>) {
        for entry in entries {
            self.entries.insert(entry.selector, entry);
        }
    }

    pub fn update(&mut self, selector: Selector, entry: RegistryEntry) {
        self.entries.insert(selector, entry);
    }

    pub fn remove(&mut self, selector: &Selector) -> Option<RegistryEntry> {
        self.entries.remove(selector)
    }

    pub fn is_registered(&self, selector: &Selector) -> bool {
        self.entries.contains_key(selector)
    }

    pub fn get(&self, selector: &Selector) -> Option<&RegistryEntry> {
        self.entries.get(selector)
    }

    /// Entries in selector order.
    pub fn entries(&self) -> impl Iterator<Item = (&Selector, &RegistryEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds a confirmed cut into the map: pending additions and
    /// replacements become `Deployed`, removals disappear.
    pub fn fold_confirmed(&mut self) {
        self.entries.retain(|_, entry| entry.action != EntryAction::Remove);
        for entry in self.entries.values_mut() {
            entry.action = EntryAction::Deployed;
        }
    }
}
