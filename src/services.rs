//! Execution-side service contracts: the periodic tick registry and the
//! screen flush hook.
//!
//! Both are invoked by the executor at its suspension points — between
//! chained translation blocks and between single instructions. They may
//! mutate registers and memory and change RIP; the chaining loop watches
//! for RIP moving and yields back to the outer dispatch when it does.

use crate::isa::Runtime;

/// A handler invoked once per executor suspension point.
pub trait TickHandler {
    fn tick(&mut self, rt: &mut Runtime<'_>);
}

/// Registry of periodic tick handlers.
#[derive(Default)]
pub struct TickRegistry {
    handlers: Vec<Box<dyn TickHandler>>,
}

impl TickRegistry {
    pub fn new() -> Self {
        TickRegistry { handlers: Vec::new() }
    }

    /// Register a tick handler.
    pub fn register(&mut self, handler: Box<dyn TickHandler>) {
        self.handlers.push(handler);
    }

    /// Invoke every registered handler.
    pub fn tick(&mut self, rt: &mut Runtime<'_>) {
        for h in &mut self.handlers {
            h.tick(rt);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Display back-end flush hook.
pub trait Screen {
    /// Called at suspension points; push dirty output to the host.
    fn flush_if_needed(&mut self);
}

/// Screen implementation for headless runs.
#[derive(Default)]
pub struct NullScreen;

impl Screen for NullScreen {
    fn flush_if_needed(&mut self) {}
}
