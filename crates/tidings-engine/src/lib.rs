//! Event orchestration engine: filtered pub/sub, an event store, windowed
//! aggregation, and session recording with paced replay.

pub mod aggregator;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod recorder;
pub mod replay;
pub mod store;
pub mod stream;

pub use aggregator::{AggregateFunction, AggregateSnapshot, Aggregator, AggregatorConfig};
pub use bus::{BusStats, EventBus, EventHandler, SubscriptionId, SubscriptionInfo};
pub use clock::{Clock, FakeClock, SystemClock};
pub use codec::{CodecRegistry, EventCodec, JsonCodec, PrettyJsonCodec};
pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, FilterInfo, StorageStats, StreamInfo};
pub use error::{EngineError, Result};
pub use filter::{
    AcceptAll, AgentFilter, CompareOp, CompositeFilter, FieldFilter, Filter, FilterConfig,
    LogicalOp, PatternFilter, SharedFilter, TimeRangeFilter, TypeFilter,
};
pub use recorder::{Recorder, RecorderStats};
pub use replay::{ReplayOptions, ReplayState, ReplayStatus, Replayer};
pub use store::{
    EventQuery, EventStore, JsonlEventStore, MAX_QUERY_LIMIT, MemoryEventStore, OrderBy,
};
pub use stream::{EventStream, StreamStats};

pub use tidings_protocol::{Event, EventKind, Value};
