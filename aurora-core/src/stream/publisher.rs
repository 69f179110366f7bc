//! Blocking publisher used from inside the host connector, which runs on
//! the blocking pool and cannot hold the async connection manager.

use std::time::Duration;

use chrono::Utc;
use redis::Commands;

use crate::error::Result;

pub struct SyncPublisher {
    conn: redis::Connection,
    channel: String,
    history_key: String,
    stopword: String,
    stop_delay: Duration,
}

impl std::fmt::Debug for SyncPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPublisher")
            .field("channel", &self.channel)
            .finish()
    }
}

impl SyncPublisher {
    pub fn open(
        redis_url: &str,
        prefix: &str,
        stopword: &str,
        stop_delay: Duration,
        job_id: &str,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_connection()?;

        // Register the job id so late subscribers can find the stream.
        let _: () = conn.zadd(
            format!("{prefix}:ids"),
            job_id,
            Utc::now().timestamp_millis(),
        )?;

        Ok(Self {
            conn,
            channel: format!("{prefix}:{job_id}"),
            history_key: format!("{prefix}:{job_id}:history"),
            stopword: stopword.to_string(),
            stop_delay,
        })
    }

    pub fn publish(&mut self, text: &str) -> Result<()> {
        let _: () = self.conn.publish(&self.channel, text)?;
        let _: () = self.conn.zadd(
            &self.history_key,
            text,
            Utc::now().timestamp_millis(),
        )?;
        Ok(())
    }

    /// End-of-stream marker. The short sleep keeps the stopword's history
    /// score strictly after the last real message.
    pub fn finish(&mut self) -> Result<()> {
        std::thread::sleep(self.stop_delay);
        let stopword = self.stopword.clone();
        self.publish(&stopword)
    }
}
