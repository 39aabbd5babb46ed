//! Startup - wires the outbox dispatcher, the event bus and the graph sync
//! consumers into one running pipeline.

use anyhow::Context;
use cube_castle_shared::config::PipelineConfigDto;
use cube_castle_shared::{employee_events, organization_events};
use cube_castle_sync_domain::events::EventDecoderRegistry;
use cube_castle_sync_domain::graph_sync::ConnectionManager;
use cube_castle_sync_domain::outbox::OutboxRepository;
use cube_castle_sync_infrastructure::messaging::DispatcherStatus;
use cube_castle_sync_infrastructure::{
    CdcConsumerManager, CdcSyncService, EmployeeGraphConsumer, InProcessEventBus, MetricsRegistry,
    OrganizationGraphConsumer, OutboxDispatcher, create_connection_manager,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct SyncPipeline {
    dispatcher: OutboxDispatcher,
    manager: Arc<CdcConsumerManager>,
    sync: Arc<CdcSyncService>,
    connection: Arc<dyn ConnectionManager>,
    metrics: MetricsRegistry,
    shutdown: CancellationToken,
}

impl SyncPipeline {
    /// Build every component; nothing runs until [`SyncPipeline::start`].
    pub fn build(
        config: &PipelineConfigDto,
        outbox: Arc<dyn OutboxRepository>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let metrics = MetricsRegistry::new();

        let bus = Arc::new(InProcessEventBus::with_metrics(
            metrics
                .event_bus()
                .context("registering event bus metrics")?,
        ));

        let connection =
            create_connection_manager(&config.graph).context("creating graph connection")?;

        let mut manager = CdcConsumerManager::new(connection.clone(), config.cdc.clone())
            .with_shutdown(shutdown.clone());
        if config.cdc.enable_metrics {
            manager = manager.with_metrics(
                metrics
                    .graph_sync()
                    .context("registering graph sync metrics")?,
            );
        }
        manager.register(Arc::new(EmployeeGraphConsumer::new(connection.clone())))?;
        manager.register(Arc::new(OrganizationGraphConsumer::new(connection.clone())))?;
        let manager = Arc::new(manager);

        let sync = Arc::new(CdcSyncService::new(manager.clone(), &config.cdc));
        let mut event_types: Vec<&str> = employee_events::ALL.to_vec();
        event_types.extend(organization_events::ALL);
        sync.subscribe(bus.as_ref(), &event_types)?;

        let dispatcher = OutboxDispatcher::new(
            outbox,
            bus,
            Arc::new(EventDecoderRegistry::with_hr_events()),
            config.dispatcher.clone(),
            &metrics,
        )?;

        Ok(Self {
            dispatcher,
            manager,
            sync,
            connection,
            metrics,
            shutdown,
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        if let Err(e) = self.connection.health_check().await {
            warn!(error = %e, "Graph store not reachable yet, consumers will retry");
        }
        self.manager.start_all(&self.shutdown).await?;
        self.dispatcher.start(&self.shutdown).await?;
        info!(
            consumers = self.manager.consumer_count(),
            graph = ?self.connection.kind(),
            "✅ Sync pipeline running"
        );
        Ok(())
    }

    /// Stop the dispatcher first so no event reaches a stopped consumer.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.dispatcher.stop().await {
            warn!(error = %e, "Outbox dispatcher did not stop cleanly");
        }
        if let Err(e) = self.manager.stop_all().await {
            warn!(error = %e, "Consumer manager did not stop cleanly");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Failed to close graph connection");
        }

        let status = self.dispatcher.status().await;
        let sync = self.sync.statistics();
        info!(
            published = status.published_total,
            failed = status.failed_total,
            synced = sync.succeeded,
            sync_failures = sync.failed,
            "👋 Sync pipeline stopped"
        );
    }

    pub async fn status(&self) -> DispatcherStatus {
        self.dispatcher.status().await
    }

    pub fn dispatcher(&self) -> &OutboxDispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_castle_shared::config::{
        CdcConfig, DatabaseConfig, DispatcherConfig, GraphConfig, GraphMode,
    };
    use cube_castle_sync_domain::outbox::NewOutboxEvent;
    use cube_castle_sync_infrastructure::InMemoryOutboxRepository;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> PipelineConfigDto {
        PipelineConfigDto {
            database: DatabaseConfig {
                url: "postgresql://localhost:5432/cube_castle".to_string(),
                pool_size: 2,
                connect_timeout: Duration::from_secs(1),
            },
            dispatcher: DispatcherConfig {
                poll_interval: Duration::from_millis(50),
                ..DispatcherConfig::default()
            },
            graph: GraphConfig {
                mode: GraphMode::Mock,
                ..GraphConfig::default()
            },
            cdc: CdcConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_pipeline_dispatches_committed_rows() {
        let outbox = InMemoryOutboxRepository::new();
        let pipeline = SyncPipeline::build(
            &config(),
            Arc::new(outbox.clone()),
            CancellationToken::new(),
        )
        .unwrap();

        let row = NewOutboxEvent::new(
            "11111111-1111-1111-1111-111111111111",
            "organization",
            organization_events::CREATED,
            json!({
                "tenant_id": "22222222-2222-2222-2222-222222222222",
                "name": "Finance",
                "code": "FIN"
            }),
        );
        outbox.insert(row.clone()).await.unwrap();

        let report = pipeline
            .dispatcher()
            .run_cycle(&CancellationToken::new())
            .await;
        assert_eq!(report.published, 1);
        assert!(outbox.get(row.event_id).await.unwrap().published);

        let text = pipeline.metrics().encode_text().unwrap();
        assert!(text.contains("graph_sync"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let pipeline = SyncPipeline::build(
            &config(),
            Arc::new(InMemoryOutboxRepository::new()),
            CancellationToken::new(),
        )
        .unwrap();

        pipeline.start().await.unwrap();
        assert!(pipeline.status().await.running);
        assert!(pipeline.start().await.is_err());

        pipeline.stop().await;
        assert!(!pipeline.status().await.running);
    }
}
