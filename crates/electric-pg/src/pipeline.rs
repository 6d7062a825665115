//! Replication pipeline
//!
//! Streams the publication from the logical slot, converts pgoutput into
//! [`WalMessage`]s and feeds them to a [`Collector`] that fans committed
//! transactions out to shape consumers. The pipeline reconnects with
//! exponential backoff until shutdown is signalled.

use crate::connection::ConnectionConfig;
use crate::convert::WalConverter;
use crate::error::PgResult;
use crate::lsn::format_lsn;
use crate::protocol::{PgOutputDecoder, ReplicationClient, ReplicationFrame, ReplicationStream};
use electric_core::{Collector, ShapeCache, WalMessage};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default logical replication slot
pub const DEFAULT_SLOT_NAME: &str = "electric_replication";

/// Default publication
pub const DEFAULT_PUBLICATION: &str = "electric_publication";

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub slot_name: String,
    pub publication: String,
    /// Interval between unsolicited standby status updates
    pub status_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slot_name: DEFAULT_SLOT_NAME.to_string(),
            publication: DEFAULT_PUBLICATION.to_string(),
            status_interval: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn with_slot_name(mut self, slot: impl Into<String>) -> Self {
        self.slot_name = slot.into();
        self
    }

    pub fn with_publication(mut self, publication: impl Into<String>) -> Self {
        self.publication = publication.into();
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }
}

/// Exponential reconnect delay
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Logical replication consumer feeding the shape cache
pub struct ReplicationPipeline {
    connection: ConnectionConfig,
    config: PipelineConfig,
    cache: ShapeCache,
}

impl ReplicationPipeline {
    pub fn new(connection: ConnectionConfig, config: PipelineConfig, cache: ShapeCache) -> Self {
        Self {
            connection,
            config,
            cache,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stream until `shutdown` fires, reconnecting after failures
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Replication pipeline stopping");
                    return;
                }
                result = self.session(&mut backoff) => match result {
                    Ok(()) => warn!("Replication stream ended by server"),
                    Err(e) => error!(
                        dsn = %self.connection.redacted(),
                        "Replication failed: {}", e
                    ),
                }
            }

            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting replication stream");
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Replication pipeline stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection from slot creation to stream end or failure
    async fn session(&self, backoff: &mut Backoff) -> PgResult<()> {
        let mut client = ReplicationClient::connect(&self.connection).await?;
        if client.create_replication_slot(&self.config.slot_name).await? {
            info!(slot = %self.config.slot_name, "Created replication slot");
        }

        // 0/0 resumes from the slot's confirmed position
        let mut stream = client
            .start_replication(&self.config.slot_name, 0, &self.config.publication)
            .await?;
        info!(
            slot = %self.config.slot_name,
            publication = %self.config.publication,
            dsn = %self.connection.redacted(),
            "Replication started"
        );
        backoff.reset();

        let mut converter = WalConverter::new();
        let mut collector = Collector::new(self.cache.dispatcher());
        let mut ticker = tokio::time::interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = stream.next_frame() => {
                    let Some(frame) = frame? else {
                        return Ok(());
                    };
                    self.handle_frame(frame, &mut converter, &mut collector, &mut stream)
                        .await?;
                }
                _ = ticker.tick() => {
                    stream.send_status_update(collector.confirmed_lsn(), false).await?;
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: ReplicationFrame,
        converter: &mut WalConverter,
        collector: &mut Collector,
        stream: &mut ReplicationStream,
    ) -> PgResult<()> {
        match frame {
            ReplicationFrame::XLogData { mut data, .. } => {
                let message = PgOutputDecoder::decode(&mut data)?;
                if let Some(wal) = converter.convert(message)? {
                    self.apply(wal, collector).await;
                }
            }
            ReplicationFrame::PrimaryKeepAlive {
                wal_end,
                reply_requested,
                ..
            } => {
                collector.advance_idle(wal_end);
                if reply_requested {
                    debug!(lsn = %format_lsn(collector.confirmed_lsn()), "Keepalive reply");
                    stream
                        .send_status_update(collector.confirmed_lsn(), false)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn apply(&self, wal: WalMessage, collector: &mut Collector) {
        if let WalMessage::Relation(relation) = &wal {
            // the table may have changed shape since its schema was cached
            self.cache
                .forget_table_schema(&relation.schema, &relation.table);
        }
        let lagging = collector.process(wal);
        if !lagging.is_empty() {
            warn!(shapes = lagging.len(), "Dropping shapes that fell behind replication");
            self.cache.drop_lagging(lagging).await;
        }
    }
}
