//! Sensor wire protocol: a 10-byte packet per reading.
//!
//! `[big-endian u16 sensor id][big-endian f64 value]`. Both fields are
//! big-endian; the value is not transmitted in the host's native byte order.
//! This is a deliberate departure from the system this gateway's protocol
//! was distilled from, which sent the value as a native-endian `memcpy` of a
//! `double` while keeping the id explicitly big-endian — a mismatch not
//! worth inheriting. Any sensor (real or simulated) that speaks this
//! protocol must encode the value big-endian.

use crate::error::GatewayError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const PACKET_SIZE: usize = 10;

/// Sensor id 0 is reserved and never assigned to a real sensor.
pub const INVALID_SENSOR_ID: u16 = 0;

/// A single reading as it travels from the connection manager to the
/// analytics and storage workers. Immutable once constructed; each consumer
/// owns its own copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub id: u16,
    pub value: f64,
    /// Seconds since the Unix epoch, stamped by the gateway at read time.
    pub timestamp: i64,
}

impl SensorReading {
    pub fn new(id: u16, value: f64, timestamp: i64) -> Self {
        Self {
            id,
            value,
            timestamp,
        }
    }

    pub fn is_valid_sensor(&self) -> bool {
        self.id != INVALID_SENSOR_ID
    }
}

/// Decode a 10-byte packet into `(sensor_id, value)`. The timestamp is not
/// part of the wire format; it is stamped by the caller at the moment of
/// read.
pub fn decode_packet(bytes: &[u8; PACKET_SIZE]) -> Result<(u16, f64), GatewayError> {
    let mut cursor = Cursor::new(&bytes[..]);
    let id = cursor
        .read_u16::<BigEndian>()
        .map_err(|e| GatewayError::ProtocolViolation(format!("reading sensor id: {e}")))?;
    let value = cursor
        .read_f64::<BigEndian>()
        .map_err(|e| GatewayError::ProtocolViolation(format!("reading value: {e}")))?;
    Ok((id, value))
}

/// Encode `(sensor_id, value)` into a 10-byte packet. Used by tests and by
/// any in-process sensor simulator.
pub fn encode_packet(id: u16, value: f64) -> [u8; PACKET_SIZE] {
    let mut buf = Vec::with_capacity(PACKET_SIZE);
    buf.write_u16::<BigEndian>(id).expect("write to Vec never fails");
    buf.write_f64::<BigEndian>(value).expect("write to Vec never fails");
    buf.try_into().expect("exactly PACKET_SIZE bytes written")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_id_and_value() {
        let packet = encode_packet(42, 21.5);
        let (id, value) = decode_packet(&packet).unwrap();
        assert_eq!(id, 42);
        assert_eq!(value, 21.5);
    }

    #[test]
    fn rejects_sensor_id_zero_as_reserved() {
        let reading = SensorReading::new(0, 10.0, 0);
        assert!(!reading.is_valid_sensor());
    }

    #[test]
    fn negative_and_fractional_values_round_trip() {
        let packet = encode_packet(7, -3.25);
        let (id, value) = decode_packet(&packet).unwrap();
        assert_eq!(id, 7);
        assert_eq!(value, -3.25);
    }
}
