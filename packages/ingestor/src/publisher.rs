//! Redis Publisher
//!
//! Mirrors realtime events to a Redis pub/sub channel so consumers outside this
//! process see the same `novo_pix` stream the websocket subscribers get.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DEFAULT_REDIS_CHANNEL;
use crate::transaction::Transaction;

/// Errors that can occur during publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Realtime message format, shared by websocket subscribers and Redis
///
/// Serialized as `{"type": "novo_pix", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeMessage {
    /// A transaction was just stored for the first time
    #[serde(rename = "novo_pix")]
    NewPix(Transaction),
}

impl RealtimeMessage {
    /// Serialize the message to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Redis publisher for realtime messages
#[derive(Clone)]
pub struct Publisher {
    connection: MultiplexedConnection,
    channel: String,
}

impl Publisher {
    /// Create a new publisher with a Redis connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `channel` - The pub/sub channel name to publish to
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    /// Create a new publisher with the default channel
    pub fn with_default_channel(connection: MultiplexedConnection) -> Self {
        Self::new(connection, DEFAULT_REDIS_CHANNEL)
    }

    /// Connect to Redis at `url` and publish on `channel`
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, channel))
    }

    /// Publish a message to Redis
    ///
    /// # Returns
    /// The number of Redis subscribers that received the message
    pub async fn publish_message(&self, message: &RealtimeMessage) -> Result<i64, PublishError> {
        let json = message.to_json()?;
        // Multiplexed connections are cheap handles onto one socket
        let mut connection = self.connection.clone();
        let subscribers: i64 = connection.publish(&self.channel, &json).await?;
        Ok(subscribers)
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}
