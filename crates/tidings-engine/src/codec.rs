//! Pluggable event serialization keyed by format name.

use std::collections::HashMap;
use std::sync::Arc;

use tidings_protocol::Event;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};

pub trait EventCodec: Send + Sync {
    /// Format name the codec is registered under
    fn name(&self) -> &str;

    fn encode(&self, event: &Event) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Event>;
}

/// Compact JSON, one object per event
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, event: &Event) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Event> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyJsonCodec;

impl EventCodec for PrettyJsonCodec {
    fn name(&self) -> &str {
        "json-pretty"
    }

    fn encode(&self, event: &Event) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(event)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Event> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn EventCodec>>>,
}

impl CodecRegistry {
    /// Registry with the built-in `json` and `json-pretty` codecs
    pub fn new() -> Self {
        let codecs: [Arc<dyn EventCodec>; 2] = [Arc::new(JsonCodec), Arc::new(PrettyJsonCodec)];
        Self {
            codecs: RwLock::new(
                codecs
                    .into_iter()
                    .map(|c| (c.name().to_string(), c))
                    .collect(),
            ),
        }
    }

    /// Register a codec, replacing any codec with the same name
    pub async fn register(&self, codec: Arc<dyn EventCodec>) {
        self.codecs
            .write()
            .await
            .insert(codec.name().to_string(), codec);
    }

    pub async fn formats(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn codec(&self, format: &str) -> Result<Arc<dyn EventCodec>> {
        self.codecs
            .read()
            .await
            .get(format)
            .cloned()
            .ok_or_else(|| EngineError::Serialization(format!("unknown format '{}'", format)))
    }

    pub async fn serialize(&self, event: &Event, format: &str) -> Result<Vec<u8>> {
        self.codec(format).await?.encode(event)
    }

    pub async fn deserialize(&self, bytes: &[u8], format: &str) -> Result<Event> {
        self.codec(format).await?.decode(bytes)
    }

    /// Encode each event on its own; one failure does not affect the others
    pub async fn serialize_batch(&self, events: &[Event], format: &str) -> Vec<Result<Vec<u8>>> {
        match self.codec(format).await {
            Ok(codec) => events.iter().map(|e| codec.encode(e)).collect(),
            Err(e) => events
                .iter()
                .map(|_| Err(EngineError::Serialization(e.to_string())))
                .collect(),
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
