//! Region-keyed cache of provider clients

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use super::api::{ClbApi, HttpClbApi};
use super::client::CloudClient;
use super::error::{ApiError, CloudError, Result};
use super::rate_limit::RateLimiter;
use crate::config::ProviderConfig;

/// Builds the raw transport for a region
pub type ApiFactory = Arc<dyn Fn(&str) -> std::result::Result<Arc<dyn ClbApi>, ApiError> + Send + Sync>;

/// Owns one [`CloudClient`] per region and the rate limiter they share.
/// Clients are created on first use and kept for the life of the registry.
pub struct ClientRegistry {
    config: ProviderConfig,
    limiter: Arc<RateLimiter>,
    factory: ApiFactory,
    clients: Mutex<HashMap<String, Arc<CloudClient>>>,
}

impl ClientRegistry {
    /// Registry backed by the HTTPS transport
    pub fn new(config: ProviderConfig) -> Self {
        let endpoint = config.endpoint.clone();
        let credentials = config.credentials.clone();
        let timeout = config.call_timeout;
        let factory: ApiFactory = Arc::new(move |_region: &str| {
            let api = HttpClbApi::new(&endpoint, credentials.clone(), timeout)?;
            Ok(Arc::new(api) as Arc<dyn ClbApi>)
        });
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: ProviderConfig, factory: ApiFactory) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            config,
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Client for `region`, created on first request
    pub fn client(&self, region: &str) -> Result<Arc<CloudClient>> {
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(client) = clients.get(region) {
            return Ok(client.clone());
        }

        let api = (self.factory)(region).map_err(|source| CloudError::Transport {
            operation: "CreateClient".to_string(),
            source,
        })?;
        let client = Arc::new(CloudClient::new(
            api,
            region,
            self.limiter.clone(),
            &self.config,
        ));
        info!("Created provider client for region {}", region);
        clients.insert(region.to_string(), client.clone());
        Ok(client)
    }

    /// Client for the configured default region
    pub fn default_client(&self) -> Result<Arc<CloudClient>> {
        self.client(&self.config.default_region)
    }
}
