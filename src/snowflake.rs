//! Snowflake ID Generator
//!
//! 64-bit fleet-unique identifiers for DNS records and domains:
//!
//! ```text
//! | 41 bits ms since epoch | 10 bits machine id | 12 bits sequence |
//! ```
//!
//! The epoch is `2025-01-03T17:03:27.047Z`. Each node is configured with its
//! own machine id (`SNOWFLAKE_MACHINE_ID`), so two nodes never mint the same id.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::lock_utils::lock_or_recover;

/// Custom epoch in Unix milliseconds
pub const EPOCH_MS: u64 = 1_735_928_607_047;

const MACHINE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

/// Largest configurable machine id
pub const MAX_MACHINE_ID: u16 = (1 << MACHINE_ID_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SnowflakeError {
    #[error("machine id {0} exceeds {max}", max = MAX_MACHINE_ID)]
    MachineIdOutOfRange(u16),
}

/// Monotonic ID generator for one machine id
#[derive(Debug)]
pub struct Snowflake {
    machine_id: u16,
    /// (last timestamp in ms since epoch, sequence within that ms)
    state: Mutex<(u64, u16)>,
}

impl Snowflake {
    pub fn new(machine_id: u16) -> Result<Self, SnowflakeError> {
        if machine_id > MAX_MACHINE_ID {
            return Err(SnowflakeError::MachineIdOutOfRange(machine_id));
        }
        Ok(Self {
            machine_id,
            state: Mutex::new((0, 0)),
        })
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    /// Generate the next id.
    ///
    /// # Panics
    /// If the wall clock moved backwards since the previous id.
    pub fn next_id(&self) -> u64 {
        let mut state = lock_or_recover(&self.state, "snowflake state");
        let (last_ms, sequence) = *state;

        let mut now = current_ms_since_epoch();
        if now < last_ms {
            panic!(
                "clock moved backwards: last id at {}ms, now {}ms since snowflake epoch",
                last_ms, now
            );
        }

        let next_sequence = if now == last_ms {
            let next = (sequence + 1) & MAX_SEQUENCE;
            if next == 0 {
                // Sequence exhausted for this millisecond
                while now <= last_ms {
                    std::hint::spin_loop();
                    now = current_ms_since_epoch();
                }
            }
            next
        } else {
            0
        };

        *state = (now, next_sequence);
        compose(now, self.machine_id, next_sequence)
    }

    /// Generate the next id in its stringified form, as stored in record metadata
    pub fn next_string(&self) -> String {
        self.next_id().to_string()
    }
}

fn compose(ms: u64, machine_id: u16, sequence: u16) -> u64 {
    (ms << (MACHINE_ID_BITS + SEQUENCE_BITS))
        | ((machine_id as u64) << SEQUENCE_BITS)
        | sequence as u64
}

/// Extract the machine id field from an id
pub fn machine_id_of(id: u64) -> u16 {
    ((id >> SEQUENCE_BITS) & MAX_MACHINE_ID as u64) as u16
}

/// Extract the timestamp (Unix milliseconds) from an id
pub fn timestamp_of(id: u64) -> u64 {
    (id >> (MACHINE_ID_BITS + SEQUENCE_BITS)) + EPOCH_MS
}

fn current_ms_since_epoch() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    now.saturating_sub(EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let generator = Snowflake::new(7).unwrap();
        let mut previous = generator.next_id();
        for _ in 0..20_000 {
            let id = generator.next_id();
            assert!(id > previous, "{} not greater than {}", id, previous);
            previous = id;
        }
    }

    #[test]
    fn test_machine_id_field() {
        let generator = Snowflake::new(513).unwrap();
        for _ in 0..100 {
            assert_eq!(machine_id_of(generator.next_id()), 513);
        }
    }

    #[test]
    fn test_timestamp_field_is_recent() {
        let generator = Snowflake::new(1).unwrap();
        let id = generator.next_id();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let ts = timestamp_of(id);
        assert!(ts <= now && now - ts < 5_000);
    }

    #[test]
    fn test_machine_id_out_of_range() {
        assert_eq!(
            Snowflake::new(1024).unwrap_err(),
            SnowflakeError::MachineIdOutOfRange(1024)
        );
        assert!(Snowflake::new(MAX_MACHINE_ID).is_ok());
    }

    #[test]
    fn test_string_form_parses_back() {
        let generator = Snowflake::new(3).unwrap();
        let id: u64 = generator.next_string().parse().unwrap();
        assert_eq!(machine_id_of(id), 3);
    }
}
