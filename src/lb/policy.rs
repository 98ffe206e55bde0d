//! Replica selection strategies.
//!
//! Both selectors address replicas positionally through the shared
//! [`EndpointRegistry`]. Their mutable state (rotation cursors, load samples)
//! is owned per selector and never shared between the two variants.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::error::RouterError;
use super::poller::LoadTable;
use super::registry::EndpointRegistry;
use super::types::EndpointRef;

/// Picks one replica of a model for a single request
pub trait SelectionPolicy: Send + Sync {
    fn select(&self, model: &str) -> Result<EndpointRef, RouterError>;

    fn name(&self) -> &'static str;
}

/// Strict per-model round-robin.
///
/// One cursor per model, starting at 0. The read-and-advance happens under the
/// model's lock so concurrent callers never observe the same cursor value.
pub struct RotatingSelector {
    registry: Arc<EndpointRegistry>,
    cursors: HashMap<String, Mutex<usize>>,
}

impl RotatingSelector {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        let cursors = registry
            .model_names()
            .map(|name| (name.to_string(), Mutex::new(0)))
            .collect();
        Self { registry, cursors }
    }

    /// Position the next call for `model` will return
    pub fn cursor(&self, model: &str) -> Option<usize> {
        self.cursors.get(model).map(|c| *c.lock())
    }
}

impl SelectionPolicy for RotatingSelector {
    fn select(&self, model: &str) -> Result<EndpointRef, RouterError> {
        let route = self.registry.lookup(model)?;
        let cursor = self
            .cursors
            .get(model)
            .ok_or_else(|| RouterError::UnknownModel(model.to_string()))?;
        let replica_count = route.replicas.len();
        if replica_count == 0 {
            return Err(RouterError::UnknownModel(model.to_string()));
        }

        let index = {
            let mut next = cursor.lock();
            let index = *next % replica_count;
            *next = (index + 1) % replica_count;
            index
        };

        let selected = route.replicas[index].clone();
        debug!(
            model = model,
            endpoint = %selected.base_url,
            index = index,
            "Selected endpoint (round-robin)"
        );
        Ok(selected)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Least queue depth among a model's replicas.
///
/// Replicas without a sample are skipped. Ties go to the lowest position.
/// When no replica of the model has a sample yet (the poller has not
/// completed a successful fetch), the first replica is returned.
pub struct LoadAwareSelector {
    registry: Arc<EndpointRegistry>,
    loads: Arc<LoadTable>,
}

impl LoadAwareSelector {
    pub fn new(registry: Arc<EndpointRegistry>, loads: Arc<LoadTable>) -> Self {
        Self { registry, loads }
    }
}

impl SelectionPolicy for LoadAwareSelector {
    fn select(&self, model: &str) -> Result<EndpointRef, RouterError> {
        let route = self.registry.lookup(model)?;

        let mut best: Option<(&EndpointRef, f64)> = None;
        for endpoint in &route.replicas {
            let Some(depth) = self.loads.queue_depth(endpoint.slot) else {
                continue;
            };
            match best {
                Some((_, lowest)) if depth >= lowest => {}
                _ => best = Some((endpoint, depth)),
            }
        }

        let selected = match best {
            Some((endpoint, depth)) => {
                debug!(
                    model = model,
                    endpoint = %endpoint.base_url,
                    index = endpoint.index,
                    queue_depth = depth,
                    "Selected endpoint (load-aware)"
                );
                endpoint
            }
            None => {
                let first = route
                    .replicas
                    .first()
                    .ok_or_else(|| RouterError::UnknownModel(model.to_string()))?;
                debug!(
                    model = model,
                    endpoint = %first.base_url,
                    "No load samples yet, falling back to first replica"
                );
                first
            }
        };

        Ok(selected.clone())
    }

    fn name(&self) -> &'static str {
        "load_aware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::types::ModelSpec;

    fn registry() -> Arc<EndpointRegistry> {
        Arc::new(
            EndpointRegistry::from_specs(
                &[
                    ModelSpec::new(
                        "llama",
                        vec!["http://h0:8000".to_string(), "http://h1:8000".to_string()],
                    ),
                    ModelSpec::new(
                        "qwen",
                        vec![
                            "http://h2:8000".to_string(),
                            "http://h3:8000".to_string(),
                            "http://h4:8000".to_string(),
                        ],
                    ),
                ],
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_rotation_cursors_are_per_model() {
        let selector = RotatingSelector::new(registry());

        assert_eq!(selector.select("llama").unwrap().index, 0);
        assert_eq!(selector.select("qwen").unwrap().index, 0);
        assert_eq!(selector.select("llama").unwrap().index, 1);
        assert_eq!(selector.select("llama").unwrap().index, 0);
        assert_eq!(selector.select("qwen").unwrap().index, 1);
        assert_eq!(selector.cursor("qwen"), Some(2));
    }

    #[test]
    fn test_rotation_unknown_model() {
        let selector = RotatingSelector::new(registry());
        assert!(matches!(
            selector.select("mistral"),
            Err(RouterError::UnknownModel(_))
        ));
        assert_eq!(selector.cursor("llama"), Some(0));
    }

    #[test]
    fn test_load_aware_ignores_other_models() {
        let registry = registry();
        let loads = Arc::new(LoadTable::new(registry.endpoint_count()));
        let selector = LoadAwareSelector::new(registry, Arc::clone(&loads));

        // Lowest depth overall belongs to llama's replica
        loads.record_success(0, 0.0);
        loads.record_success(2, 4.0);
        loads.record_success(3, 5.0);
        loads.record_success(4, 3.0);

        let selected = selector.select("qwen").unwrap();
        assert_eq!(selected.base_url, "http://h4:8000");
        assert_eq!(selected.index, 2);
    }

    #[test]
    fn test_load_aware_skips_unsampled_replicas() {
        let registry = registry();
        let loads = Arc::new(LoadTable::new(registry.endpoint_count()));
        let selector = LoadAwareSelector::new(registry, Arc::clone(&loads));

        loads.record_success(1, 9.0);
        assert_eq!(selector.select("llama").unwrap().index, 1);
    }
}
