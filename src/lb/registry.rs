use std::collections::{HashMap, HashSet};

use url::Url;

use super::error::{ConfigError, RouterError};
use super::types::{EndpointRef, ModelRoute, ModelSpec};

/// Static model name -> replica list mapping, immutable once built.
///
/// Replica order is exactly the configured order. Each base URL occupies one
/// position in the whole registry, so positional addressing (rotation, load
/// state) always refers to a single physical backend.
#[derive(Debug)]
pub struct EndpointRegistry {
    routes: Vec<ModelRoute>,
    by_name: HashMap<String, usize>,
    endpoint_count: usize,
}

impl EndpointRegistry {
    pub fn from_specs(
        specs: &[ModelSpec],
        expected_endpoints: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::NoModels);
        }

        let mut routes = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        let mut seen_urls = HashSet::new();
        let mut slot = 0;

        for spec in specs {
            if by_name.contains_key(&spec.name) {
                return Err(ConfigError::DuplicateModel {
                    model: spec.name.clone(),
                });
            }
            if spec.urls.is_empty() {
                return Err(ConfigError::EmptyReplicas {
                    model: spec.name.clone(),
                });
            }

            let mut replicas = Vec::with_capacity(spec.urls.len());
            for (index, raw) in spec.urls.iter().enumerate() {
                let base_url = normalize_base_url(raw)?;
                if !seen_urls.insert(base_url.clone()) {
                    return Err(ConfigError::DuplicateEndpoint { url: base_url });
                }
                replicas.push(EndpointRef {
                    base_url,
                    index,
                    slot,
                });
                slot += 1;
            }

            by_name.insert(spec.name.clone(), routes.len());
            routes.push(ModelRoute {
                model_name: spec.name.clone(),
                replicas,
            });
        }

        if let Some(expected) = expected_endpoints {
            if expected != slot {
                return Err(ConfigError::ConfigurationMismatch {
                    expected,
                    actual: slot,
                });
            }
        }

        Ok(Self {
            routes,
            by_name,
            endpoint_count: slot,
        })
    }

    pub fn lookup(&self, model: &str) -> Result<&ModelRoute, RouterError> {
        self.by_name
            .get(model)
            .map(|&i| &self.routes[i])
            .ok_or_else(|| RouterError::UnknownModel(model.to_string()))
    }

    pub fn routes(&self) -> &[ModelRoute] {
        &self.routes
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.model_name.as_str())
    }

    /// All endpoints in slot order, paired with their model name.
    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &EndpointRef)> {
        self.routes
            .iter()
            .flat_map(|r| r.replicas.iter().map(move |e| (r.model_name.as_str(), e)))
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoint_count
    }

    pub fn model_count(&self) -> usize {
        self.routes.len()
    }
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let parsed = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(raw.trim_end_matches('/').to_string())
}
