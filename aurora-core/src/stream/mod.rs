//! Per-job pub/sub with replayable history.
//!
//! Every message published for a job goes two places: the live channel
//! `<prefix>:<job>` and the sorted set `<prefix>:<job>:history`, scored
//! by epoch milliseconds. Late subscribers drain the history first and
//! then attach live. The configured stopword marks end-of-stream.

mod publisher;

pub use publisher::SyncPublisher;

use chrono::Utc;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::Result;

#[derive(Clone)]
pub struct StreamBus {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    stopword: String,
}

impl std::fmt::Debug for StreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBus")
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// A live subscription to one job's stream. The pump task feeding the
/// channel stops after forwarding the stopword.
#[derive(Debug)]
pub struct JobSubscription {
    receiver: mpsc::Receiver<String>,
}

impl JobSubscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl StreamBus {
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let client = redis::Client::open(settings.redis_url())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            prefix: settings.pubsub_prefix.clone(),
            stopword: settings.pubsub_stopword.clone(),
        })
    }

    pub fn stopword(&self) -> &str {
        &self.stopword
    }

    fn channel(&self, job_id: &str) -> String {
        format!("{}:{}", self.prefix, job_id)
    }

    fn history_key(&self, job_id: &str) -> String {
        format!("{}:{}:history", self.prefix, job_id)
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    /// Record the job in the stream index so subscribers can join after
    /// submission and the retention sweep can find its history later.
    pub async fn register_job(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(
                self.ids_key(),
                job_id,
                Utc::now().timestamp_millis(),
            )
            .await?;
        Ok(())
    }

    /// Publish a message live and append it to the job's history.
    pub async fn publish(&self, job_id: &str, text: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(self.channel(job_id), text).await?;
        let _: () = conn
            .zadd(
                self.history_key(job_id),
                text,
                Utc::now().timestamp_millis(),
            )
            .await?;
        Ok(())
    }

    pub async fn publish_stopword(&self, job_id: &str) -> Result<()> {
        let stopword = self.stopword.clone();
        self.publish(job_id, &stopword).await
    }

    /// The persisted history for a job, in publish order.
    pub async fn history(&self, job_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> =
            conn.zrange(self.history_key(job_id), 0, -1).await?;
        Ok(items)
    }

    /// Attach to the live channel. Returns a receiver whose pump stops
    /// after the stopword comes through.
    pub async fn subscribe(&self, job_id: &str) -> Result<JobSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel(job_id)).await?;

        let (tx, rx) = mpsc::channel(64);
        let stopword = self.stopword.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("Dropping undecodable stream payload: {err}");
                        continue;
                    }
                };
                let done = payload == stopword;
                if tx.send(payload).await.is_err() || done {
                    break;
                }
            }
        });

        Ok(JobSubscription { receiver: rx })
    }

    /// Drop history older than the retention window, plus the index
    /// entries pointing at it. Returns (histories removed, ids removed).
    pub async fn sweep_history(
        &self,
        retention_days: i64,
    ) -> Result<(u64, u64)> {
        let cutoff = Utc::now().timestamp_millis()
            - retention_days * 24 * 60 * 60 * 1000;
        let mut conn = self.conn.clone();

        let stale_ids: Vec<String> = conn
            .zrangebyscore(self.ids_key(), "-inf", cutoff)
            .await?;

        let mut removed = 0u64;
        for job_id in &stale_ids {
            let deleted: u64 = conn.del(self.history_key(job_id)).await?;
            removed += deleted;
        }
        let dropped: u64 = conn
            .zrembyscore(self.ids_key(), "-inf", cutoff)
            .await?;

        debug!(
            "Stream retention removed {removed} histories, {dropped} ids"
        );
        Ok((removed, dropped))
    }
}
