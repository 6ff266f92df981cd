//! Subscription registry.
//!
//! Maps event type names to the handler bindings subscribed to them. Each bus
//! owns one registry; nothing here is process-global.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Opaque token the handler resolver uses to produce a handler instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerBindingId(String);

impl HandlerBindingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerBindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerBindingId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for HandlerBindingId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One (event type, handler) association.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionBinding {
    pub event_type_name: String,
    pub binding_id: HandlerBindingId,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error(
        "Handler binding '{binding_id}' is already subscribed to '{existing}', cannot also subscribe it to '{requested}'"
    )]
    DuplicateBinding {
        binding_id: HandlerBindingId,
        existing: String,
        requested: String,
    },
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Event type -> bindings in subscription order.
    by_event_type: HashMap<String, Vec<HandlerBindingId>>,
    /// Reverse index enforcing one event type per binding.
    by_binding: HashMap<HandlerBindingId, String>,
}

/// Concurrent registry of subscription bindings.
///
/// Reads (the dispatch path) share the lock; subscribe/unsubscribe take it
/// exclusively. Lookups return owned copies so callers never hold the lock
/// while handlers run.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    ///
    /// Re-adding an identical pair is a no-op. Returns `true` if the binding
    /// was newly added.
    pub async fn subscribe(
        &self,
        event_type_name: &str,
        binding_id: HandlerBindingId,
    ) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.by_binding.get(&binding_id) {
            if existing == event_type_name {
                debug!(
                    event_type = %event_type_name,
                    binding = %binding_id,
                    "Binding already registered"
                );
                return Ok(false);
            }
            return Err(RegistryError::DuplicateBinding {
                binding_id,
                existing: existing.clone(),
                requested: event_type_name.to_string(),
            });
        }

        state
            .by_binding
            .insert(binding_id.clone(), event_type_name.to_string());
        let bindings = state
            .by_event_type
            .entry(event_type_name.to_string())
            .or_default();
        bindings.push(binding_id.clone());

        info!(
            event_type = %event_type_name,
            binding = %binding_id,
            binding_count = bindings.len(),
            "Handler subscribed"
        );
        Ok(true)
    }

    /// Remove a binding. Absent bindings are ignored.
    ///
    /// Returns `true` if a binding was removed.
    pub async fn unsubscribe(&self, event_type_name: &str, binding_id: &HandlerBindingId) -> bool {
        let mut state = self.state.write().await;

        match state.by_binding.get(binding_id) {
            Some(existing) if existing == event_type_name => {}
            _ => return false,
        }
        state.by_binding.remove(binding_id);

        let now_empty = match state.by_event_type.get_mut(event_type_name) {
            Some(bindings) => {
                bindings.retain(|b| b != binding_id);
                bindings.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.by_event_type.remove(event_type_name);
        }

        info!(
            event_type = %event_type_name,
            binding = %binding_id,
            "Handler unsubscribed"
        );
        true
    }

    /// Bindings for an event type, in subscription order.
    pub async fn bindings(&self, event_type_name: &str) -> Vec<HandlerBindingId> {
        self.state
            .read()
            .await
            .by_event_type
            .get(event_type_name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn has_bindings(&self, event_type_name: &str) -> bool {
        self.state
            .read()
            .await
            .by_event_type
            .contains_key(event_type_name)
    }

    /// Every event type with at least one binding.
    pub async fn subscribed_event_types(&self) -> BTreeSet<String> {
        self.state
            .read()
            .await
            .by_event_type
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of all bindings, grouped by event type in name order.
    pub async fn all_bindings(&self) -> Vec<SubscriptionBinding> {
        let state = self.state.read().await;
        let mut event_types: Vec<_> = state.by_event_type.keys().collect();
        event_types.sort();

        event_types
            .into_iter()
            .flat_map(|event_type| {
                state.by_event_type[event_type]
                    .iter()
                    .map(move |binding_id| SubscriptionBinding {
                        event_type_name: event_type.clone(),
                        binding_id: binding_id.clone(),
                    })
            })
            .collect()
    }

    /// Total number of bindings.
    pub async fn len(&self) -> usize {
        self.state.read().await.by_binding.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every binding (shutdown).
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.by_event_type.clear();
        state.by_binding.clear();
    }
}
