//! Per-property observation state: last value, counters, bounded history,
//! and running statistics.
use crate::constants::RECENT_EVENT_CAP;
use crate::property::ValidationEvent;
use crate::utils::now_ms;
use shared::Value;
use shared::rpc::{HistoryPoint, PropertyStateView, RunningStats};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Welford online mean/variance with min/max tracking.
#[derive(Debug, Clone, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Welford {
    fn update(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    fn view(&self) -> RunningStats {
        RunningStats {
            min: self.min,
            max: self.max,
            mean: self.mean,
            variance: self.variance(),
            samples: self.count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyState {
    pub value: Value,
    pub bytes: Vec<u8>,
    pub last_changed_ms: Option<u64>,
    pub last_read_ms: Option<u64>,
    pub read_count: u64,
    pub write_count: u64,
    history: VecDeque<HistoryPoint>,
    stats: Option<Welford>,
    recent_events: VecDeque<ValidationEvent>,
}

/// All per-property states behind one lock, independent of the block lock
/// so a slow listener cannot stall property reads.
pub struct StateMap {
    inner: RwLock<HashMap<String, PropertyState>>,
    history_cap: usize,
}

impl StateMap {
    pub fn new(history_cap: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            history_cap,
        }
    }

    /// Records a successful decode. Returns whether the value changed.
    ///
    /// State is created on the first decode and never removed while the
    /// mapping stays loaded.
    pub fn observe_read(&self, name: &str, value: &Value, bytes: &[u8]) -> bool {
        let now = now_ms();
        let mut map = self.inner.write().unwrap();
        match map.get_mut(name) {
            None => {
                let mut state = PropertyState {
                    value: value.clone(),
                    bytes: bytes.to_vec(),
                    last_changed_ms: Some(now),
                    last_read_ms: Some(now),
                    read_count: 1,
                    write_count: 0,
                    history: VecDeque::with_capacity(self.history_cap.min(16)),
                    stats: None,
                    recent_events: VecDeque::new(),
                };
                Self::track_change(&mut state, value, now, self.history_cap);
                map.insert(name.to_string(), state);
                true
            }
            Some(state) => {
                state.read_count += 1;
                state.last_read_ms = Some(now);
                if state.value != *value {
                    state.value = value.clone();
                    state.bytes = bytes.to_vec();
                    state.last_changed_ms = Some(now);
                    Self::track_change(state, value, now, self.history_cap);
                    true
                } else {
                    state.bytes = bytes.to_vec();
                    false
                }
            }
        }
    }

    fn track_change(state: &mut PropertyState, value: &Value, now: u64, cap: usize) {
        if cap > 0 {
            if state.history.len() == cap {
                state.history.pop_front();
            }
            state.history.push_back(HistoryPoint {
                value: value.clone(),
                timestamp_ms: now,
            });
        }
        if let Some(x) = value.as_f64() {
            state.stats.get_or_insert_with(Welford::default).update(x);
        }
    }

    pub fn observe_write(&self, name: &str) {
        if let Some(state) = self.inner.write().unwrap().get_mut(name) {
            state.write_count += 1;
        }
    }

    pub fn record_events(&self, name: &str, events: &[ValidationEvent]) {
        if events.is_empty() {
            return;
        }
        if let Some(state) = self.inner.write().unwrap().get_mut(name) {
            for event in events {
                if state.recent_events.len() == RECENT_EVENT_CAP {
                    state.recent_events.pop_front();
                }
                state.recent_events.push_back(event.clone());
            }
        }
    }

    pub fn view(&self, name: &str, frozen: bool) -> Option<PropertyStateView> {
        let map = self.inner.read().unwrap();
        let state = map.get(name)?;
        Some(PropertyStateView {
            name: name.to_string(),
            value: state.value.clone(),
            bytes: state.bytes.clone(),
            frozen,
            last_changed_ms: state.last_changed_ms,
            last_read_ms: state.last_read_ms,
            read_count: state.read_count,
            write_count: state.write_count,
            history: state.history.iter().cloned().collect(),
            stats: state.stats.as_ref().map(Welford::view),
        })
    }

    /// Drops all state; reload path only.
    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }
}
