//! Context providers and aggregation.
//!
//! Hosts can contribute values into the evaluation context beyond the
//! raw field inputs (session data, environment, feature toggles). The
//! aggregator folds providers in registration order over a base map;
//! later writes win. Providers also receive cache lifecycle
//! notifications so external caches can track the engine's.

use std::collections::BTreeMap;

use formwork_core::Value;

/// A source of context values, folded into every evaluation context.
pub trait ContextProvider {
    /// Given the context assembled so far, return the full map to carry
    /// forward. Implementations typically extend `base` and return it.
    fn contribute(&self, base: BTreeMap<String, Value>) -> BTreeMap<String, Value>;

    /// A rule wrote a property.
    fn on_property_set(&mut self, _target: &str, _value: &Value) {}

    /// A field's cached state was invalidated.
    fn on_field_invalidated(&mut self, _field: &str) {}

    /// The whole engine was reset.
    fn on_cache_cleared(&mut self) {}
}

/// A fixed map of context values.
pub struct StaticContextProvider {
    values: BTreeMap<String, Value>,
}

impl StaticContextProvider {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        StaticContextProvider { values }
    }
}

impl ContextProvider for StaticContextProvider {
    fn contribute(&self, mut base: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        base.extend(self.values.clone());
        base
    }
}

/// Ordered collection of providers.
#[derive(Default)]
pub struct ContextAggregator {
    providers: Vec<Box<dyn ContextProvider>>,
}

impl ContextAggregator {
    pub fn new() -> Self {
        ContextAggregator::default()
    }

    pub fn register(&mut self, provider: Box<dyn ContextProvider>) {
        self.providers.push(provider);
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Fold every provider over the base map, in registration order.
    pub fn assemble(&self, base: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        self.providers
            .iter()
            .fold(base, |acc, provider| provider.contribute(acc))
    }

    pub fn notify_property_set(&mut self, target: &str, value: &Value) {
        for provider in &mut self.providers {
            provider.on_property_set(target, value);
        }
    }

    pub fn notify_field_invalidated(&mut self, field: &str) {
        for provider in &mut self.providers {
            provider.on_field_invalidated(field);
        }
    }

    pub fn notify_cache_cleared(&mut self) {
        for provider in &mut self.providers {
            provider.on_cache_cleared();
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
