//! Configuration for sync sessions.

use std::time::Duration;

/// Configuration for a sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Logical database identifier (room id on the server).
    pub db_name: String,
    /// Schema name the local database was created with.
    pub schema_name: String,
    /// Schema version the local database was created with.
    pub schema_version: String,
    /// Remote endpoint URL.
    pub endpoint: String,
    /// Optional access token presented at connect time.
    pub access_token: Option<String>,
    /// Schema content to apply on connect ("create if missing").
    pub schema_content: Option<String>,
    /// Outbound buffer threshold that counts as backpressure, in bytes.
    pub buffer_limit: usize,
    /// Retry and reconnect timing.
    pub backoff: BackoffConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(
        db_name: impl Into<String>,
        schema_name: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            schema_name: schema_name.into(),
            schema_version: schema_version.into(),
            endpoint: String::new(),
            access_token: None,
            schema_content: None,
            buffer_limit: 5 * 1024 * 1024,
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the remote endpoint URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Sets schema content to apply on connect.
    pub fn with_schema_content(mut self, content: impl Into<String>) -> Self {
        self.schema_content = Some(content.into());
        self
    }

    /// Sets the outbound buffer backpressure threshold.
    pub fn with_buffer_limit(mut self, bytes: usize) -> Self {
        self.buffer_limit = bytes;
        self
    }

    /// Sets the retry and reconnect timing.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Retry and reconnect timing knobs.
///
/// Send backoff covers buffer-full retries inside an open connection;
/// connect backoff covers socket reconnects.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First buffer-full retry delay.
    pub send_floor: Duration,
    /// Buffer-full retry delay ceiling.
    pub send_ceiling: Duration,
    /// Fixed retry delay while the transport is reconnecting.
    pub reconnect_probe: Duration,
    /// First socket reconnect delay.
    pub connect_floor: Duration,
    /// Socket reconnect delay ceiling.
    pub connect_ceiling: Duration,
}

impl BackoffConfig {
    /// Sets the buffer-full retry floor.
    pub fn with_send_floor(mut self, delay: Duration) -> Self {
        self.send_floor = delay;
        self
    }

    /// Sets the buffer-full retry ceiling.
    pub fn with_send_ceiling(mut self, delay: Duration) -> Self {
        self.send_ceiling = delay;
        self
    }

    /// Sets the fixed reconnecting-probe delay.
    pub fn with_reconnect_probe(mut self, delay: Duration) -> Self {
        self.reconnect_probe = delay;
        self
    }

    /// Sets the socket reconnect floor.
    pub fn with_connect_floor(mut self, delay: Duration) -> Self {
        self.connect_floor = delay;
        self
    }

    /// Sets the socket reconnect ceiling.
    pub fn with_connect_ceiling(mut self, delay: Duration) -> Self {
        self.connect_ceiling = delay;
        self
    }

    /// Doubles a delay, clamped to the given ceiling.
    pub(crate) fn doubled(delay: Duration, ceiling: Duration) -> Duration {
        (delay * 2).min(ceiling)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            send_floor: Duration::from_millis(50),
            send_ceiling: Duration::from_millis(1000),
            reconnect_probe: Duration::from_millis(3000),
            connect_floor: Duration::from_millis(5000),
            connect_ceiling: Duration::from_millis(60000),
        }
    }
}
