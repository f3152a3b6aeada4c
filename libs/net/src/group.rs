//! Groups of event loops handed out round-robin.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::info;

use crate::event_loop::NetEventLoop;

/// A named set of event loops.
pub struct EventLoopGroup {
    name: String,
    loops: RwLock<Vec<NetEventLoop>>,
    cursor: AtomicUsize,
}

impl EventLoopGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loops: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Create a group and start `count` loops named `{name}-{i}`.
    pub fn spawn(name: impl Into<String>, count: usize) -> io::Result<Self> {
        let group = Self::new(name);
        for i in 0..count {
            group.add(NetEventLoop::spawn(format!("{}-{}", group.name, i))?);
        }
        info!(group = %group.name, loops = count, "Event loop group started");
        Ok(group)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, event_loop: NetEventLoop) {
        self.loops.write().push(event_loop);
    }

    pub fn len(&self) -> usize {
        self.loops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.read().is_empty()
    }

    /// Next open loop in round-robin order, or `None` if none is left.
    pub fn next(&self) -> Option<NetEventLoop> {
        let loops = self.loops.read();
        let count = loops.len();
        for _ in 0..count {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
            if !loops[idx].is_closed() {
                return Some(loops[idx].clone());
            }
        }
        None
    }

    /// Close and forget every loop.
    pub fn close(&self) {
        let loops = std::mem::take(&mut *self.loops.write());
        for event_loop in &loops {
            event_loop.close();
        }
        info!(group = %self.name, loops = loops.len(), "Event loop group closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let group = EventLoopGroup::spawn("rr", 2).unwrap();
        let a = group.next().unwrap();
        let b = group.next().unwrap();
        let c = group.next().unwrap();
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&c));
        group.close();
    }

    #[test]
    fn test_empty_or_closed_group_yields_none() {
        let group = EventLoopGroup::new("empty");
        assert!(group.next().is_none());

        let group = EventLoopGroup::spawn("closed", 1).unwrap();
        group.close();
        assert!(group.is_empty());
        assert!(group.next().is_none());
    }

    #[test]
    fn test_skips_closed_loops() {
        let group = EventLoopGroup::spawn("skip", 2).unwrap();
        let first = group.next().unwrap();
        first.close();
        for _ in 0..4 {
            assert!(!group.next().unwrap().ptr_eq(&first));
        }
        group.close();
    }
}
