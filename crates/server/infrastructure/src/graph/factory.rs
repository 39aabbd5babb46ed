//! Connection manager selection by configured [`GraphMode`]

use super::http::HttpConnectionManager;
use super::mock::MockConnectionManager;
use cube_castle_shared::config::{GraphConfig, GraphMode};
use cube_castle_sync_domain::graph_sync::{ConnectionManager, GraphError};
use std::sync::Arc;
use tracing::info;

pub fn create_connection_manager(
    config: &GraphConfig,
) -> Result<Arc<dyn ConnectionManager>, GraphError> {
    info!(mode = %config.mode, "Creating graph connection manager");
    let manager: Arc<dyn ConnectionManager> = match config.mode {
        GraphMode::Mock => Arc::new(MockConnectionManager::from_config(config)),
        GraphMode::Http => Arc::new(HttpConnectionManager::new(config)?),
    };
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_castle_sync_domain::graph_sync::ConnectionKind;
    use std::time::Duration;

    #[test]
    fn test_factory_honours_mode() {
        let mock = create_connection_manager(&GraphConfig::default()).unwrap();
        assert_eq!(mock.kind(), ConnectionKind::Mock);
        assert_eq!(mock.retry_policy().max_retries, 3);

        let http = create_connection_manager(&GraphConfig {
            mode: GraphMode::Http,
            retry_backoff: Duration::from_millis(250),
            ..GraphConfig::default()
        })
        .unwrap();
        assert_eq!(http.kind(), ConnectionKind::Http);
        assert_eq!(http.retry_policy().backoff, Duration::from_millis(250));
    }
}
