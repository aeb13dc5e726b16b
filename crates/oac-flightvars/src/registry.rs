use std::collections::HashMap;

use oac_proto::{SubscriptionId, VariableId};

use crate::error::RegistryError;

/// Bijection between variables and their subscription ids.
///
/// Both maps are only touched through the methods below, which check every
/// precondition before mutating so a pair is inserted into (or removed from)
/// both maps or neither.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    by_var: HashMap<VariableId, SubscriptionId>,
    by_subscription: HashMap<SubscriptionId, VariableId>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_var.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_var.is_empty()
    }

    pub fn register(&mut self, var: VariableId, subscription: SubscriptionId) -> Result<(), RegistryError> {
        if self.by_var.contains_key(&var) {
            return Err(RegistryError::VariableAlreadyExists(var));
        }
        if self.by_subscription.contains_key(&subscription) {
            return Err(RegistryError::SubscriptionAlreadyExists(subscription));
        }
        self.by_subscription.insert(subscription, var.clone());
        self.by_var.insert(var, subscription);
        Ok(())
    }

    pub fn lookup_by_var(&self, var: &VariableId) -> Result<SubscriptionId, RegistryError> {
        self.by_var
            .get(var)
            .copied()
            .ok_or_else(|| RegistryError::NoSuchVariable(var.clone()))
    }

    pub fn lookup_by_subscription(&self, subscription: SubscriptionId) -> Result<&VariableId, RegistryError> {
        self.by_subscription
            .get(&subscription)
            .ok_or(RegistryError::NoSuchSubscription(subscription))
    }

    pub fn contains_var(&self, var: &VariableId) -> bool {
        self.by_var.contains_key(var)
    }

    pub fn contains_subscription(&self, subscription: SubscriptionId) -> bool {
        self.by_subscription.contains_key(&subscription)
    }

    /// Removes the pair keyed by `var` and returns its subscription id.
    pub fn unregister_var(&mut self, var: &VariableId) -> Result<SubscriptionId, RegistryError> {
        let subscription = self
            .by_var
            .remove(var)
            .ok_or_else(|| RegistryError::NoSuchVariable(var.clone()))?;
        self.by_subscription.remove(&subscription);
        Ok(subscription)
    }

    /// Removes the pair keyed by `subscription` and returns its variable.
    pub fn unregister_subscription(&mut self, subscription: SubscriptionId) -> Result<VariableId, RegistryError> {
        let var = self
            .by_subscription
            .remove(&subscription)
            .ok_or(RegistryError::NoSuchSubscription(subscription))?;
        self.by_var.remove(&var);
        Ok(var)
    }

    /// Visits every subscription id, in no particular order.
    pub fn for_each<F: FnMut(SubscriptionId)>(&self, mut f: F) {
        for id in self.by_subscription.keys() {
            f(*id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VariableId, SubscriptionId)> {
        self.by_var.iter().map(|(var, id)| (var, *id))
    }

    /// Copies the current pairs, sorted by variable.
    pub fn snapshot(&self) -> Vec<(VariableId, SubscriptionId)> {
        let mut pairs: Vec<_> = self.iter().map(|(var, id)| (var.clone(), id)).collect();
        pairs.sort();
        pairs
    }

    pub fn clear(&mut self) {
        self.by_var.clear();
        self.by_subscription.clear();
    }
}
