use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flint::logging::{self, Logger};
use flint::shared::{WireError, WireResult};

/// Handler scheduling classes, most urgent first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Monitor,
    High,
    Medium,
    Low,
}

/// A short, non-blocking unit of work driven round-robin by the event loop.
/// `pump` returns true when it did work and false when it was idle; a fatal
/// error drops the handler from the loop.
pub trait Pump: Send {
    fn name(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn pump(&mut self) -> WireResult<bool>;
}

const IDLE_PARK: Duration = Duration::from_millis(10);

/// Cooperative event loop: handlers are kept ordered by priority and driven
/// in rounds; a fully idle round parks the worker until a notifier fires or
/// the park times out.
pub struct EventLoop {
    handlers: Mutex<Vec<Box<dyn Pump>>>,
    incoming: Mutex<Vec<Box<dyn Pump>>>,
    wakeup: Mutex<bool>,
    parked: Condvar,
    closed: AtomicBool,
    log: Logger,
}

impl EventLoop {
    pub fn new(log: &Logger) -> Arc<EventLoop> {
        Arc::new(EventLoop {
            handlers: Mutex::new(Vec::new()),
            incoming: Mutex::new(Vec::new()),
            wakeup: Mutex::new(false),
            parked: Condvar::new(),
            closed: AtomicBool::new(false),
            log: log.new(logging::o!("component" => "evloop")),
        })
    }

    /// Hands a handler to the loop; it is picked up at the next round.
    pub fn register(&self, handler: Box<dyn Pump>) {
        logging::debug!(self.log, "handler registered"; "handler" => handler.name());
        self.incoming.lock().push(handler);
        self.wake();
    }

    /// Wakes a parked worker.
    pub fn wake(&self) {
        let mut pending = self.wakeup.lock();
        *pending = true;
        self.parked.notify_all();
    }

    /// A cloneable hook that wakes this loop; handed to modification
    /// iterators and subscription queues.
    pub fn notifier(self: &Arc<Self>) -> Arc<dyn Fn() + Send + Sync> {
        let evloop = self.clone();
        Arc::new(move || evloop.wake())
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs rounds until shutdown. Intended to own its thread.
    pub fn run(&self) {
        logging::debug!(self.log, "event loop running");

        while !self.is_closed() {
            let did_work = self.round();

            if !did_work {
                let mut pending = self.wakeup.lock();
                if !*pending {
                    let _ = self.parked.wait_for(&mut pending, IDLE_PARK);
                }
                *pending = false;
            }
        }

        logging::debug!(self.log, "event loop stopped");
    }

    /// Spawns a worker thread driving `run`.
    pub fn spawn(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let evloop = self.clone();
        thread::Builder::new()
            .name("vitrine-evloop".to_string())
            .spawn(move || evloop.run())
            .expect("Failed spawning the event loop thread")
    }

    /// One full pass over the handlers in priority order. Public for tests
    /// and single-threaded embeddings.
    pub fn round(&self) -> bool {
        let mut handlers = self.handlers.lock();

        {
            let mut incoming = self.incoming.lock();
            if !incoming.is_empty() {
                handlers.append(&mut incoming);
                handlers.sort_by_key(|handler| handler.priority());
            }
        }

        let mut did_work = false;
        let mut index = 0;

        while index < handlers.len() {
            match handlers[index].pump() {
                Ok(true) => {
                    did_work = true;
                    index += 1;
                }
                Ok(false) | Err(WireError::Wait) => index += 1,
                Err(WireError::Fatal(kind)) => {
                    let handler = handlers.remove(index);
                    logging::warn!(
                        self.log, "handler dropped";
                        "handler" => handler.name(), "error" => ?kind
                    );
                }
            }
        }

        did_work
    }

    #[cfg(test)]
    fn handler_count(&self) -> usize {
        self.handlers.lock().len() + self.incoming.lock().len()
    }
}
