use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Custom epoch: 2025-01-01T00:00:00Z in milliseconds since Unix epoch.
const HUDDLE_EPOCH_MS: u64 = 1_735_689_600_000;

const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit snowflake generator used for group ids.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits), ms since the huddle epoch
/// - Bits 21–12: Node ID (10 bits)
/// - Bits 11–0:  Sequence (12 bits), per-ms counter, max 4096/ms
///
/// A clock that steps backwards is treated as standing still: ids keep
/// being issued from the last observed millisecond.
pub struct SnowflakeGenerator {
    node_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Node ids wider than 10 bits are masked.
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: u64::from(node_id) & NODE_MASK,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> u64 {
        let mut state = self.state.lock();

        let mut now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond.
                while now_ms <= state.last_ms {
                    std::hint::spin_loop();
                    now_ms = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now_ms;

        let ts = now_ms.saturating_sub(HUDDLE_EPOCH_MS);
        (ts << (NODE_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | state.sequence
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Extract the creation time from a snowflake ID.
pub fn snowflake_timestamp(id: u64) -> Option<DateTime<Utc>> {
    let ms = (id >> (NODE_BITS + SEQUENCE_BITS)) + HUDDLE_EPOCH_MS;
    Utc.timestamp_millis_opt(ms as i64).single()
}
