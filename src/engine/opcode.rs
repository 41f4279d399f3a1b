//! Opcodes and the per-priority dispatch queue (C11).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaHandle};
use crate::storage::DatafileId;

/// Subset of opcodes that matter to this crate (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Query,
    ExtentRead,
    ExtentWrite,
    FlushMain,
    EvictMain,
    EvictOpen,
    EvictExtent,
    DatabaseRotate,
    JournalIndex,
    CtxPopulateMrg,
    CtxFlushDirty,
    CtxFlushHotDirty,
    CtxQuiesce,
    CtxShutdown,
    Cleanup,
    ShutdownEvloop,
    Noop,
}

impl Opcode {
    /// Whether the back-pressure policy may defer this opcode under
    /// `BackPressure::Critical` (§4.7).
    pub fn is_deferrable_under_pressure(self) -> bool {
        matches!(self, Opcode::Query | Opcode::ExtentRead)
    }
}

/// Number of distinct priority lanes the queue maintains; 0 is highest.
pub const STORAGE_PRIORITIES: usize = 5;

pub const PRIORITY_INTERNAL: u8 = 0;
pub const PRIORITY_HIGH: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 2;
pub const PRIORITY_LOW: u8 = 3;
pub const PRIORITY_BEST_EFFORT: u8 = 4;

/// Anti-starvation: a priority lane that has won the last this-many
/// dequeues in a row yields once to a lower-priority lane if one has work.
const ANTI_STARVATION_THRESHOLD: u32 = 50;

#[derive(Debug, Clone)]
pub enum CommandPayload {
    Extent {
        datafile_id: DatafileId,
        extent_offset: u64,
    },
    None,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub opcode: Opcode,
    pub priority: u8,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(opcode: Opcode, priority: u8) -> Self {
        Self {
            opcode,
            priority,
            payload: CommandPayload::None,
        }
    }
}

struct Lanes {
    queues: Vec<VecDeque<ArenaHandle>>,
    consecutive_dequeues: HashMap<u8, u32>,
}

/// One linked list per `STORAGE_PRIORITY`, dequeued high-to-low with a
/// periodic anti-starvation skip. Command envelopes live in `commands`,
/// an arena slab (C1); the lanes only ever hold the stable handle, so a
/// command enqueued at one priority and later bumped doesn't need its
/// payload copied around.
pub struct OpcodeQueue {
    lanes: Mutex<Lanes>,
    commands: Arena<Command>,
}

impl OpcodeQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                queues: (0..STORAGE_PRIORITIES).map(|_| VecDeque::new()).collect(),
                consecutive_dequeues: HashMap::new(),
            }),
            commands: Arena::new(),
        }
    }

    pub fn push(&self, cmd: Command) {
        let lane = (cmd.priority as usize).min(STORAGE_PRIORITIES - 1);
        let handle = self.commands.alloc(cmd);
        self.lanes.lock().queues[lane].push_back(handle);
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pop(&self) -> Option<Command> {
        let handle = {
            let mut lanes = self.lanes.lock();
            let mut found = None;
            for priority in 0..STORAGE_PRIORITIES {
                if lanes.queues[priority].is_empty() {
                    continue;
                }
                let lower_has_work = (priority + 1..STORAGE_PRIORITIES)
                    .any(|lower| !lanes.queues[lower].is_empty());
                let count = lanes
                    .consecutive_dequeues
                    .entry(priority as u8)
                    .or_insert(0);
                if *count >= ANTI_STARVATION_THRESHOLD && lower_has_work {
                    *count = 0;
                    continue;
                }
                *count += 1;
                found = lanes.queues[priority].pop_front();
                break;
            }
            found
        }?;
        Some(self.commands.free(handle))
    }
}

impl Default for OpcodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch pressure, derived from dispatched-but-unfinished work versus
/// the worker pool's configured size (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackPressure {
    Relaxed,
    Stressed,
    Critical,
}

pub fn classify_back_pressure(dispatched: usize, worker_pool_size: usize) -> BackPressure {
    let pool = worker_pool_size.max(1);
    if dispatched >= pool * 2 {
        BackPressure::Critical
    } else if dispatched >= pool {
        BackPressure::Stressed
    } else {
        BackPressure::Relaxed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_drains_high_priority_before_low() {
        let q = OpcodeQueue::new();
        q.push(Command::new(Opcode::Query, PRIORITY_LOW));
        q.push(Command::new(Opcode::ExtentWrite, PRIORITY_HIGH));
        let first = q.pop().unwrap();
        assert_eq!(first.priority, PRIORITY_HIGH);
    }

    #[test]
    fn anti_starvation_yields_to_lower_priority_after_threshold() {
        let q = OpcodeQueue::new();
        for _ in 0..(ANTI_STARVATION_THRESHOLD + 5) {
            q.push(Command::new(Opcode::Query, PRIORITY_HIGH));
        }
        q.push(Command::new(Opcode::Cleanup, PRIORITY_BEST_EFFORT));

        let mut saw_low_priority_before_exhausting_high = false;
        for _ in 0..(ANTI_STARVATION_THRESHOLD + 5) {
            let cmd = q.pop().unwrap();
            if cmd.priority == PRIORITY_BEST_EFFORT {
                saw_low_priority_before_exhausting_high = true;
                break;
            }
        }
        assert!(saw_low_priority_before_exhausting_high);
    }

    #[test]
    fn back_pressure_levels_scale_with_pool_size() {
        assert_eq!(classify_back_pressure(1, 4), BackPressure::Relaxed);
        assert_eq!(classify_back_pressure(4, 4), BackPressure::Stressed);
        assert_eq!(classify_back_pressure(8, 4), BackPressure::Critical);
    }
}
