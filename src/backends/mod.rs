pub mod headers;
pub mod http;
pub mod traits;

pub use headers::apply_header_rules;
pub use http::HttpProvider;
pub use traits::{ProviderClient, ProviderRequest, ProviderResponse, TokenUsage};

use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::types::Result;

/// Build the client for a configured provider.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn ProviderClient>> {
    let client = HttpProvider::new(config)?;
    tracing::info!(
        provider = %config.id,
        priority = config.priority,
        backend = ?config.backend_type,
        endpoint = %config.endpoint,
        ssl_verify = config.ssl_verify,
        "Registered provider"
    );
    Ok(Arc::new(client))
}
