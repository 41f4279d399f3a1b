//! Event loop and worker pool (C11). The loop owns opcode dispatch and
//! never itself blocks on disk; blocking/CPU-bound work runs on
//! `tokio::task::spawn_blocking` tasks, which stand in for the dedicated
//! worker pool (§5).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::engine::opcode::{classify_back_pressure, BackPressure, Command, Opcode, OpcodeQueue, PRIORITY_INTERNAL};

/// Runs one dispatched opcode. Implemented by whatever owns the
/// datafiles/caches/registry this event loop serves; invoked on a
/// blocking worker task, never on the loop itself.
pub trait OpcodeHandler: Send + Sync + 'static {
    fn handle(&self, cmd: Command);
}

/// Owns the opcode queue, the single-flight invariants (`pending_rotate`,
/// `migration_to_v2_running`, `max_flushers`), and the dispatch loop.
pub struct EventLoop<H: OpcodeHandler> {
    queue: Arc<OpcodeQueue>,
    handler: Arc<H>,
    worker_pool_size: usize,
    dispatched: Arc<AtomicUsize>,
    pending_rotate: AtomicBool,
    migration_to_v2_running: AtomicBool,
    active_flushers: AtomicU32,
    max_flushers: u32,
    shutdown_requested: AtomicBool,
}

impl<H: OpcodeHandler> EventLoop<H> {
    pub fn new(handler: H, worker_pool_size: usize, max_flushers: u32) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(OpcodeQueue::new()),
            handler: Arc::new(handler),
            worker_pool_size: worker_pool_size.max(1),
            dispatched: Arc::new(AtomicUsize::new(0)),
            pending_rotate: AtomicBool::new(false),
            migration_to_v2_running: AtomicBool::new(false),
            active_flushers: AtomicU32::new(0),
            max_flushers: max_flushers.max(1),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &Arc<OpcodeQueue> {
        &self.queue
    }

    pub fn back_pressure(&self) -> BackPressure {
        classify_back_pressure(self.dispatched.load(Ordering::Acquire), self.worker_pool_size)
    }

    /// At most one rotation per context.
    pub fn try_begin_rotate(&self) -> bool {
        !self.pending_rotate.swap(true, Ordering::AcqRel)
    }

    pub fn end_rotate(&self) {
        self.pending_rotate.store(false, Ordering::Release);
    }

    /// At most one journal v2 migration per context.
    pub fn try_begin_migration_to_v2(&self) -> bool {
        !self.migration_to_v2_running.swap(true, Ordering::AcqRel)
    }

    pub fn end_migration_to_v2(&self) {
        self.migration_to_v2_running.store(false, Ordering::Release);
    }

    /// At most `max_flushers` concurrent flush-main workers.
    pub fn try_begin_flush(&self) -> bool {
        let mut cur = self.active_flushers.load(Ordering::Acquire);
        loop {
            if cur >= self.max_flushers {
                return false;
            }
            match self.active_flushers.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn end_flush(&self) {
        self.active_flushers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.queue.push(Command::new(Opcode::ShutdownEvloop, PRIORITY_INTERNAL));
    }

    /// Drives the loop until `SHUTDOWN_EVLOOP` is dequeued. Workers may
    /// re-enter `Query`/`ExtentRead` handling from inside their own
    /// blocking task as long as back-pressure is not `Critical`; that
    /// re-entrancy is the handler's responsibility, not modeled here.
    pub async fn run(self: Arc<Self>) {
        loop {
            let Some(cmd) = self.queue.pop() else {
                if self.shutdown_requested.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            };

            if matches!(cmd.opcode, Opcode::ShutdownEvloop) {
                debug!("event loop: shutdown opcode received");
                break;
            }

            if cmd.opcode.is_deferrable_under_pressure() && self.back_pressure() == BackPressure::Critical {
                self.queue.push(cmd);
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }

            self.dispatched.fetch_add(1, Ordering::AcqRel);
            let handler = Arc::clone(&self.handler);
            let dispatched = Arc::clone(&self.dispatched);
            tokio::task::spawn_blocking(move || {
                handler.handle(cmd);
                dispatched.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}
