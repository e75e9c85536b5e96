//! Analytics worker (C4): per-sensor running average with hysteresis alerting.

use std::sync::Arc;

use crate::log_sink::{LogEvent, LogSink};
use crate::room_map::RoomMap;
use crate::staging_buffer::StagingBuffer;
use crate::wire::SensorReading;

const INITIAL_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempState {
    Normal,
    TooCold,
    TooHot,
}

impl TempState {
    fn classify(avg: f64, too_cold: f64, too_hot: f64) -> Self {
        if avg < too_cold {
            TempState::TooCold
        } else if avg > too_hot {
            TempState::TooHot
        } else {
            TempState::Normal
        }
    }
}

/// Incrementally maintained per-sensor statistics. `count >= 1` for any
/// entry that exists; the average is computed on demand rather than stored.
#[derive(Debug, Clone)]
pub struct SensorStats {
    pub id: u16,
    pub sum: f64,
    pub count: u64,
    pub last_state: TempState,
}

impl SensorStats {
    fn new(id: u16) -> Self {
        Self {
            id,
            sum: 0.0,
            count: 0,
            last_state: TempState::Normal,
        }
    }

    pub fn average(&self) -> f64 {
        self.sum / self.count as f64
    }
}

pub struct AnalyticsConfig {
    pub too_cold: f64,
    pub too_hot: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            too_cold: 15.0,
            too_hot: 30.0,
        }
    }
}

/// Owns the stats table exclusively; no sharing, no synchronization needed
/// beyond the staging buffer it consumes from.
pub struct AnalyticsWorker {
    stats: Vec<SensorStats>,
    config: AnalyticsConfig,
    room_map: Arc<RoomMap>,
    log_sink: Arc<dyn LogSink>,
}

impl AnalyticsWorker {
    pub fn new(config: AnalyticsConfig, room_map: Arc<RoomMap>, log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            stats: Vec::with_capacity(INITIAL_CAPACITY),
            config,
            room_map,
            log_sink,
        }
    }

    fn find_or_create(&mut self, id: u16) -> &mut SensorStats {
        if let Some(idx) = self.stats.iter().position(|s| s.id == id) {
            return &mut self.stats[idx];
        }
        if self.stats.len() == self.stats.capacity() {
            // amortized doubling; try_reserve models the spec's "out of
            // memory" path as a logged, non-fatal event instead of a panic.
            if self.stats.try_reserve(self.stats.capacity().max(1)).is_err() {
                self.log_sink.emit(LogEvent::Error(format!(
                    "failed to grow sensor stats table for sensor {id}, dropping reading"
                )));
            }
        }
        self.stats.push(SensorStats::new(id));
        self.stats.last_mut().expect("just pushed")
    }

    /// Consume one reading: update running average, emit an alert only on a
    /// state transition (AN1/AN2). Sensor id 0 is logged and skipped.
    pub fn observe(&mut self, reading: SensorReading) {
        if !reading.is_valid_sensor() {
            self.log_sink.emit(LogEvent::Warning(format!(
                "dropping reading with reserved sensor id 0 at timestamp {}",
                reading.timestamp
            )));
            return;
        }

        let too_cold = self.config.too_cold;
        let too_hot = self.config.too_hot;
        let room = self.room_map.room_for(reading.id);

        let stats = self.find_or_create(reading.id);
        stats.sum += reading.value;
        stats.count += 1;
        let avg = stats.average();
        let new_state = TempState::classify(avg, too_cold, too_hot);

        if new_state != stats.last_state {
            stats.last_state = new_state;
            self.emit_alert(reading.id, avg, new_state, room);
        }
    }

    fn emit_alert(&self, sensor_id: u16, avg: f64, state: TempState, room: Option<i32>) {
        let location = match room {
            Some(room_id) => format!("room {room_id}"),
            None => format!("sensor {sensor_id}"),
        };
        let message = match state {
            TempState::Normal => format!("{location}: temperature back to normal (avg {avg:.2})"),
            TempState::TooCold => format!("{location}: too cold (avg {avg:.2})"),
            TempState::TooHot => format!("{location}: too hot (avg {avg:.2})"),
        };
        self.log_sink.emit(LogEvent::Warning(message));
    }

    pub fn stats_for(&self, id: u16) -> Option<&SensorStats> {
        self.stats.iter().find(|s| s.id == id)
    }

    /// Runs until the staging buffer reports shutdown.
    pub fn run(mut self, buffer: Arc<StagingBuffer<SensorReading>>) {
        loop {
            match buffer.remove() {
                Ok(reading) => self.observe(reading),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::NullLogSink;

    fn worker() -> AnalyticsWorker {
        AnalyticsWorker::new(
            AnalyticsConfig::default(),
            Arc::new(RoomMap::empty()),
            Arc::new(NullLogSink),
        )
    }

    #[test]
    fn an1_running_average_matches_formula() {
        let mut w = worker();
        let values = [10.0, 20.0, 18.0, 22.0];
        let mut running_sum = 0.0;
        for (k, &v) in values.iter().enumerate() {
            w.observe(SensorReading::new(7, v, 0));
            running_sum += v;
            let expected = running_sum / (k as f64 + 1.0);
            assert!((w.stats_for(7).unwrap().average() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn an2_alert_only_on_transition() {
        struct CountingSink {
            count: std::sync::atomic::AtomicUsize,
        }
        impl LogSink for CountingSink {
            fn emit(&self, _event: LogEvent) {
                self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let sink = Arc::new(CountingSink {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        let mut w = AnalyticsWorker::new(
            AnalyticsConfig::default(),
            Arc::new(RoomMap::empty()),
            sink.clone(),
        );

        // 31.0 repeatedly: average stays above 30 (too hot) throughout.
        w.observe(SensorReading::new(7, 31.0, 0));
        w.observe(SensorReading::new(7, 31.0, 1));
        w.observe(SensorReading::new(7, 31.0, 2));

        assert_eq!(sink.count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(w.stats_for(7).unwrap().last_state, TempState::TooHot);
    }

    #[test]
    fn reserved_sensor_id_is_dropped_not_tracked() {
        let mut w = worker();
        w.observe(SensorReading::new(0, 99.0, 0));
        assert!(w.stats_for(0).is_none());
    }

    #[test]
    fn classification_boundaries() {
        assert_eq!(TempState::classify(15.0, 15.0, 30.0), TempState::Normal);
        assert_eq!(TempState::classify(14.999, 15.0, 30.0), TempState::TooCold);
        assert_eq!(TempState::classify(30.0, 15.0, 30.0), TempState::Normal);
        assert_eq!(TempState::classify(30.001, 15.0, 30.0), TempState::TooHot);
    }
}
