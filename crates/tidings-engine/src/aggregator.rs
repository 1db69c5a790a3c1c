//! Sliding-window aggregation over live events.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tidings_protocol::Event;
use uuid::Uuid;

use crate::bus::EventHandler;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::filter::{AcceptAll, FilterConfig, SharedFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    #[default]
    Count,
    Sum,
    Average,
    /// Events per second over the window
    Rate,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Average => "average",
            AggregateFunction::Rate => "rate",
        }
    }

    fn needs_field(&self) -> bool {
        matches!(self, AggregateFunction::Sum | AggregateFunction::Average)
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateFunction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(AggregateFunction::Count),
            "sum" => Ok(AggregateFunction::Sum),
            "average" | "avg" => Ok(AggregateFunction::Average),
            "rate" => Ok(AggregateFunction::Rate),
            other => Err(EngineError::InvalidConfiguration(format!(
                "unknown aggregation function '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorConfig {
    pub name: String,
    /// Window length in seconds
    pub window: f64,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub function: AggregateFunction,
    /// Numeric field read by `sum` and `average`
    #[serde(default)]
    pub field: Option<String>,
}

impl AggregatorConfig {
    pub fn new(name: impl Into<String>, window_secs: f64) -> Self {
        Self {
            name: name.into(),
            window: window_secs,
            filter: None,
            function: AggregateFunction::Count,
            field: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_function(mut self, function: AggregateFunction, field: Option<String>) -> Self {
        self.function = function;
        self.field = field;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub id: String,
    pub name: String,
    pub count: usize,
    /// Window length in seconds
    pub window: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub function: AggregateFunction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub value: f64,
}

#[derive(Default)]
struct WindowState {
    buffer: VecDeque<Event>,
    last_update: Option<DateTime<Utc>>,
}

pub struct Aggregator {
    id: String,
    name: String,
    filter: SharedFilter,
    window: Duration,
    window_secs: f64,
    function: AggregateFunction,
    field: Option<String>,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if !config.window.is_finite() || config.window <= 0.0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "aggregator window must be a positive number of seconds, got {}",
                config.window
            )));
        }
        if config.function.needs_field() && config.field.is_none() {
            return Err(EngineError::InvalidConfiguration(format!(
                "aggregation '{}' requires a field",
                config.function
            )));
        }

        let filter = match &config.filter {
            Some(filter) => filter.build()?,
            None => Arc::new(AcceptAll),
        };
        let millis = (config.window * 1000.0).round();
        let window = if millis < i64::MAX as f64 {
            Duration::try_milliseconds(millis as i64)
        } else {
            None
        }
        .ok_or_else(|| {
            EngineError::InvalidConfiguration(format!(
                "aggregator window of {} seconds is out of range",
                config.window
            ))
        })?;
        if window <= Duration::zero() {
            return Err(EngineError::InvalidConfiguration(
                "aggregator window is shorter than a millisecond".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: config.name,
            filter,
            window,
            window_secs: config.window,
            function: config.function,
            field: config.field,
            clock,
            state: Mutex::new(WindowState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filter selecting the events this aggregator receives
    pub fn filter(&self) -> SharedFilter {
        self.filter.clone()
    }

    pub fn on_event(&self, event: &Event) {
        let now = self.clock.now();
        let cutoff = self.cutoff(now);

        let mut state = self.state.lock();
        state.buffer.push_back(event.clone());
        state.last_update = Some(now);
        let Some(cutoff) = cutoff else {
            return;
        };
        while state
            .buffer
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            state.buffer.pop_front();
        }
    }

    /// Oldest timestamp still inside the window. `None` when the window
    /// reaches past the earliest representable instant.
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.window)
    }

    /// Current aggregate. Entries that have aged out since the last event are
    /// skipped, not removed.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let cutoff = self.cutoff(self.clock.now());
        let state = self.state.lock();
        let live: Vec<&Event> = state
            .buffer
            .iter()
            .filter(|e| cutoff.is_none_or(|cutoff| e.timestamp >= cutoff))
            .collect();

        let value = match self.function {
            AggregateFunction::Count => live.len() as f64,
            AggregateFunction::Rate => live.len() as f64 / self.window_secs,
            AggregateFunction::Sum | AggregateFunction::Average => {
                let samples: Vec<f64> = live.iter().filter_map(|e| self.sample(e)).collect();
                let sum: f64 = samples.iter().sum();
                match (self.function, samples.len()) {
                    (AggregateFunction::Sum, _) => sum,
                    (_, 0) => 0.0,
                    (_, n) => sum / n as f64,
                }
            }
        };

        AggregateSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            count: live.len(),
            window: self.window_secs,
            last_update: state.last_update,
            function: self.function,
            field: self.field.clone(),
            value,
        }
    }

    /// Drop buffered events; the aggregator keeps receiving new ones
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.buffer.clear();
        state.last_update = None;
    }

    fn sample(&self, event: &Event) -> Option<f64> {
        self.field
            .as_deref()
            .and_then(|field| event.field(field))
            .and_then(|v| v.to_number())
    }
}

impl EventHandler for Aggregator {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.on_event(event);
        Ok(())
    }
}
