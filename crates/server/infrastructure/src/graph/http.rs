//! Neo4j connection manager over the HTTP transactional endpoint
//!
//! ```text
//! begin     POST   {uri}/db/{database}/tx          -> commit URL
//! statement POST   {uri}/db/{database}/tx/{id}
//! commit    POST   {uri}/db/{database}/tx/{id}/commit
//! rollback  DELETE {uri}/db/{database}/tx/{id}
//! ```
//!
//! Concurrent transactions are capped at `max_connections`; each open
//! transaction holds one semaphore permit.

use super::cypher::{
    CypherStatement, compile_count_nodes, compile_find_node, compile_mutation, compile_neighbors,
    parse_outcome, properties_from_json,
};
use async_trait::async_trait;
use chrono::Utc;
use cube_castle_shared::config::GraphConfig;
use cube_castle_sync_domain::graph_sync::{
    AccessMode, ConnectionKind, ConnectionManager, Direction, GraphError, GraphMutation,
    GraphTransaction, MutationOutcome, Neighbor, NodeRef, OperationStats, Properties, RetryPolicy,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    commit: Option<String>,
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<ServerError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    columns: Vec<String>,
    data: Vec<ResultRow>,
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    code: String,
    message: String,
}

fn map_transport_error(error: reqwest::Error) -> GraphError {
    if error.is_timeout() {
        GraphError::Timeout(error.to_string())
    } else if error.is_connect() || error.is_body() {
        GraphError::Connection(error.to_string())
    } else {
        GraphError::Other(error.to_string())
    }
}

/// Error for a non-success HTTP status.
///
/// Gateway and availability failures are transient; anything else the
/// server rejected is not.
fn status_error(status: StatusCode, body: &str) -> GraphError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            GraphError::Unavailable(format!("graph store returned {}", status))
        }
        _ => GraphError::Transaction(format!("HTTP {}: {}", status, body)),
    }
}

/// Shared HTTP plumbing of the manager and its transactions
struct Endpoint {
    client: Client,
    username: String,
    password: String,
}

impl Endpoint {
    fn authorize(&self, request: RequestBuilder, mode: AccessMode) -> RequestBuilder {
        let request = request.basic_auth(&self.username, Some(&self.password));
        match mode {
            AccessMode::Read => request.header("access-mode", "READ"),
            AccessMode::Write => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        mode: AccessMode,
        statements: &[CypherStatement],
    ) -> Result<TxResponse, GraphError> {
        let response = self
            .authorize(request, mode)
            .json(&json!({ "statements": statements }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body: TxResponse = response.json().await.map_err(map_transport_error)?;
        if let Some(error) = body.errors.first() {
            return Err(GraphError::Query {
                code: error.code.clone(),
                message: error.message.clone(),
            });
        }
        Ok(body)
    }
}

pub struct HttpConnectionManager {
    endpoint: Arc<Endpoint>,
    tx_base: String,
    permits: Arc<Semaphore>,
    retry_policy: RetryPolicy,
    stats: OperationStats,
    closed: AtomicBool,
}

impl HttpConnectionManager {
    pub fn new(config: &GraphConfig) -> Result<Self, GraphError> {
        let client = Client::builder()
            .connect_timeout(config.connection_timeout)
            .timeout(config.max_transaction_time)
            .pool_max_idle_per_host(config.max_connections as usize)
            .build()
            .map_err(|e| GraphError::Connection(format!("failed to build http client: {}", e)))?;

        let tx_base = format!(
            "{}/db/{}/tx",
            config.uri.trim_end_matches('/'),
            config.database
        );
        info!(endpoint = %tx_base, max_connections = config.max_connections, "🔗 Graph HTTP connection manager ready");

        Ok(Self {
            endpoint: Arc::new(Endpoint {
                client,
                username: config.username.clone(),
                password: config.password.clone(),
            }),
            tx_base,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1) as usize)),
            retry_policy: RetryPolicy::from_config(config),
            stats: OperationStats::default(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.closed.load(Ordering::Acquire) {
            Err(GraphError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConnectionManager for HttpConnectionManager {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Http
    }

    async fn begin(&self, mode: AccessMode) -> Result<Box<dyn GraphTransaction>, GraphError> {
        self.ensure_open()?;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GraphError::Closed)?;

        let request = self.endpoint.client.post(&self.tx_base);
        let response = self.endpoint.send(request, mode, &[]).await?;
        let tx_url = response
            .commit
            .as_deref()
            .map(|commit| commit.trim_end_matches("/commit").to_string())
            .ok_or_else(|| GraphError::Transaction("begin response has no commit URL".into()))?;

        debug!(tx = %tx_url, mode = %mode, "Graph transaction opened");
        Ok(Box::new(HttpTransaction {
            endpoint: self.endpoint.clone(),
            tx_url,
            mode,
            finished: false,
            _permit: permit,
        }))
    }

    async fn health_check(&self) -> Result<(), GraphError> {
        self.ensure_open()?;
        let request = self
            .endpoint
            .client
            .post(format!("{}/commit", self.tx_base));
        let statement = CypherStatement {
            text: "RETURN 1".to_string(),
            parameters: Default::default(),
        };
        self.endpoint
            .send(request, AccessMode::Read, &[statement])
            .await
            .map(|_| ())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn stats(&self) -> &OperationStats {
        &self.stats
    }

    async fn close(&self) -> Result<(), GraphError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.permits.close();
            info!("Graph HTTP connection manager closed");
        }
        Ok(())
    }
}

struct HttpTransaction {
    endpoint: Arc<Endpoint>,
    tx_url: String,
    mode: AccessMode,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

impl HttpTransaction {
    async fn run(&self, statement: CypherStatement) -> Result<StatementResult, GraphError> {
        let request = self.endpoint.client.post(&self.tx_url);
        let response = self
            .endpoint
            .send(request, self.mode, std::slice::from_ref(&statement))
            .await?;
        response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::Other("statement returned no result".to_string()))
    }
}

#[async_trait]
impl GraphTransaction for HttpTransaction {
    async fn apply(&mut self, mutation: &GraphMutation) -> Result<MutationOutcome, GraphError> {
        let result = self.run(compile_mutation(mutation, Utc::now())?).await?;
        match result.data.first() {
            Some(row) => parse_outcome(&result.columns, &row.row),
            None => Ok(MutationOutcome::default()),
        }
    }

    async fn find_node(&mut self, node: &NodeRef) -> Result<Option<Properties>, GraphError> {
        let result = self.run(compile_find_node(node)?).await?;
        result
            .data
            .first()
            .and_then(|row| row.row.first())
            .map(properties_from_json)
            .transpose()
    }

    async fn count_nodes(&mut self, label: &str) -> Result<u64, GraphError> {
        let result = self.run(compile_count_nodes(label)?).await?;
        Ok(result
            .data
            .first()
            .and_then(|row| row.row.first())
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn neighbors(
        &mut self,
        node: &NodeRef,
        rel_type: &str,
        direction: Direction,
    ) -> Result<Vec<Neighbor>, GraphError> {
        let result = self
            .run(compile_neighbors(node, rel_type, direction)?)
            .await?;
        result
            .data
            .iter()
            .map(|row| match row.row.as_slice() {
                [node, relationship] => Ok(Neighbor {
                    node: properties_from_json(node)?,
                    relationship: properties_from_json(relationship)?,
                }),
                other => Err(GraphError::Other(format!(
                    "expected node and relationship columns, got {} values",
                    other.len()
                ))),
            })
            .collect()
    }

    async fn commit(mut self: Box<Self>) -> Result<(), GraphError> {
        self.finished = true;
        let request = self
            .endpoint
            .client
            .post(format!("{}/commit", self.tx_url));
        self.endpoint.send(request, self.mode, &[]).await?;
        debug!(tx = %self.tx_url, "Graph transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), GraphError> {
        self.finished = true;
        let response = self
            .endpoint
            .authorize(self.endpoint.client.delete(&self.tx_url), self.mode)
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(GraphError::Transaction(format!(
                "rollback of {} returned {}",
                self.tx_url,
                response.status()
            )));
        }
        Ok(())
    }
}

impl Drop for HttpTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Best effort: the server also expires idle transactions
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let request = self
            .endpoint
            .authorize(self.endpoint.client.delete(&self.tx_url), self.mode);
        let tx_url = self.tx_url.clone();
        runtime.spawn(async move {
            if let Err(e) = request.send().await {
                warn!(tx = %tx_url, error = %e, "Failed to roll back abandoned graph transaction");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_castle_sync_domain::graph_sync::Retryable;

    #[test]
    fn test_gateway_statuses_are_retried() {
        for status in [
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            let error = status_error(status, "");
            assert!(matches!(error, GraphError::Unavailable(_)), "{}", status);
            assert!(error.is_retryable());
        }
    }

    #[test]
    fn test_rejected_requests_are_fatal() {
        let error = status_error(StatusCode::UNAUTHORIZED, "bad credentials");
        assert!(matches!(&error, GraphError::Transaction(m) if m.contains("401")));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_server_error_payload_decodes() {
        let body: TxResponse = serde_json::from_value(json!({
            "results": [],
            "errors": [{
                "code": "Neo.TransientError.Transaction.DeadlockDetected",
                "message": "deadlock"
            }]
        }))
        .unwrap();
        assert_eq!(body.errors.len(), 1);
        assert!(body.errors[0].code.contains("TransientError"));
        assert!(body.commit.is_none());
    }

    #[test]
    fn test_result_rows_decode() {
        let body: TxResponse = serde_json::from_value(json!({
            "commit": "http://localhost:7474/db/neo4j/tx/12/commit",
            "results": [{
                "columns": ["matched", "created", "applied"],
                "data": [{ "row": [1, 0, 1], "meta": [null, null, null] }]
            }],
            "errors": []
        }))
        .unwrap();
        let result = &body.results[0];
        let outcome = parse_outcome(&result.columns, &result.data[0].row).unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(
            body.commit.as_deref().map(|c| c.trim_end_matches("/commit")),
            Some("http://localhost:7474/db/neo4j/tx/12")
        );
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_begin() {
        let manager = HttpConnectionManager::new(&GraphConfig {
            uri: "http://127.0.0.1:1".to_string(),
            ..GraphConfig::default()
        })
        .unwrap();
        manager.close().await.unwrap();
        assert!(matches!(
            manager.begin(AccessMode::Write).await,
            Err(GraphError::Closed)
        ));
    }

    #[tokio::test]
    #[ignore = "Requires a running Neo4j instance"]
    async fn test_health_check_against_local_neo4j() {
        let manager = HttpConnectionManager::new(&GraphConfig::default()).unwrap();
        manager.health_check().await.unwrap();
    }
}
