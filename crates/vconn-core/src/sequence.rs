//! Sequence allocation
//!
//! Virtual connection ids come from a plain process-wide counter. Message ids
//! are tagged with the sender's role and numeric id in the high bits so a
//! hex dump of an id tells you who sent it.

use crate::types::EntityName;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bits reserved for the message counter
pub const MSG_COUNTER_BITS: u32 = 40;
const MSG_COUNTER_MASK: u64 = (1 << MSG_COUNTER_BITS) - 1;
const MSG_NUM_BITS: u32 = 20;
const MSG_NUM_MASK: u64 = (1 << MSG_NUM_BITS) - 1;
const MSG_TYPE_SHIFT: u32 = MSG_COUNTER_BITS + MSG_NUM_BITS;

/// Issues monotonically increasing virtual connection and message ids
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    vconn_counter: AtomicU64,
    msg_counter: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next virtual connection id. Never returns 0, which means "unknown".
    pub fn next(&self) -> u64 {
        self.vconn_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last id handed out by `next`
    pub fn current(&self) -> u64 {
        self.vconn_counter.load(Ordering::Relaxed)
    }

    /// Next message id tagged with the sending entity
    pub fn next_message_id(&self, owner: &EntityName) -> u64 {
        let counter = self.msg_counter.fetch_add(1, Ordering::Relaxed) + 1;
        compose_message_id(owner, counter)
    }
}

/// `type << 60 | num << 40 | counter`
pub fn compose_message_id(owner: &EntityName, counter: u64) -> u64 {
    let type_bits = owner.entity_type.type_code() & 0xF;
    let num_bits = if owner.has_num() {
        (owner.num as u64) & MSG_NUM_MASK
    } else {
        0
    };
    (type_bits << MSG_TYPE_SHIFT) | (num_bits << MSG_COUNTER_BITS) | (counter & MSG_COUNTER_MASK)
}

/// Split a message id into `(type code, numeric id bits, counter)`
pub fn split_message_id(id: u64) -> (u64, u64, u64) {
    (
        id >> MSG_TYPE_SHIFT,
        (id >> MSG_COUNTER_BITS) & MSG_NUM_MASK,
        id & MSG_COUNTER_MASK,
    )
}
