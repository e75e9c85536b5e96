//! Room map (C2): static sensor-id → room-id lookup, loaded once at startup.

use log::warn;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Immutable after load; shared freely between threads via an `Arc`.
#[derive(Debug, Default, Clone)]
pub struct RoomMap {
    sensor_to_room: HashMap<u16, i32>,
}

impl RoomMap {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn room_for(&self, sensor_id: u16) -> Option<i32> {
        self.sensor_to_room.get(&sensor_id).copied()
    }

    pub fn len(&self) -> usize {
        self.sensor_to_room.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensor_to_room.is_empty()
    }

    /// Load from `<room_id>,<sensor_id>` lines. Blank lines and lines whose
    /// first non-whitespace character is `#` are skipped. A malformed line
    /// is skipped with a warning rather than aborting the whole load. A
    /// missing file is logged and an empty map is returned — analytics
    /// still runs, alerts just report the sensor id instead of a room id.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("could not open room map {}: {e}; continuing without it", path.display());
                return Self::empty();
            }
        };
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Self {
        let mut sensor_to_room = HashMap::new();
        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((room_id, sensor_id)) => {
                    sensor_to_room.insert(sensor_id, room_id);
                }
                None => {
                    warn!("room map line {}: could not parse {raw_line:?}, skipping", lineno + 1);
                }
            }
        }
        Self { sensor_to_room }
    }
}

fn parse_line(line: &str) -> Option<(i32, u16)> {
    let mut parts = line.splitn(2, ',');
    let room_id: i32 = parts.next()?.trim().parse().ok()?;
    let sensor_id: u16 = parts.next()?.trim().parse().ok()?;
    Some((room_id, sensor_id))
}
