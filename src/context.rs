//! Process-local context regions.
//!
//! A context is an opaque block of process memory that events reference by
//! address instead of by value. Context events never serialise the region;
//! only the pointer-sized address travels inside the payload buffer, and the
//! consuming task dereferences it on the local rank.

use crate::event::CONTEXT_TAG_BASE;
use parking_lot::Mutex;

/// Handle to a defined context kind. The tag doubles as the wire type tag of
/// events carrying instances of this context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextRef {
    tag: i32,
}

impl ContextRef {
    pub(crate) fn tag(&self) -> i32 {
        self.tag
    }
}

#[derive(Debug)]
struct ContextKind {
    size: usize,
    /// Instances stay alive for the lifetime of the manager so that the
    /// addresses handed out remain valid while events referencing them are
    /// in flight.
    instances: Vec<Box<[u8]>>,
}

/// Registry of context kinds and their live instances.
#[derive(Debug, Default)]
pub struct ContextManager {
    kinds: Mutex<Vec<ContextKind>>,
}

impl ContextManager {
    pub(crate) fn new() -> ContextManager {
        ContextManager::default()
    }

    /// Define a new context kind of `size` bytes.
    pub fn define(&self, size: usize) -> ContextRef {
        let mut kinds = self.kinds.lock();
        kinds.push(ContextKind {
            size,
            instances: Vec::new(),
        });
        ContextRef {
            tag: CONTEXT_TAG_BASE + (kinds.len() as i32 - 1),
        }
    }

    /// Allocate a zeroed instance of the kind and return its address.
    pub fn create(&self, ctx: ContextRef) -> usize {
        let mut kinds = self.kinds.lock();
        let idx = (ctx.tag - CONTEXT_TAG_BASE) as usize;
        let kind = kinds.get_mut(idx).expect("undefined context kind");
        kind.instances.push(vec![0u8; kind.size].into_boxed_slice());
        kind.instances.last().unwrap().as_ptr() as usize
    }

    pub(crate) fn is_context_tag(&self, tag: i32) -> bool {
        if tag < CONTEXT_TAG_BASE {
            return false;
        }
        let idx = (tag - CONTEXT_TAG_BASE) as usize;
        idx < self.kinds.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defined_kinds_hand_out_distinct_tags() {
        let mgr = ContextManager::new();
        let a = mgr.define(16);
        let b = mgr.define(32);
        assert_ne!(a.tag(), b.tag());
        assert!(mgr.is_context_tag(a.tag()));
        assert!(mgr.is_context_tag(b.tag()));
        assert!(!mgr.is_context_tag(0));
        assert!(!mgr.is_context_tag(a.tag() + 2));
    }

    #[test]
    fn created_instances_are_distinct_and_nonzero() {
        let mgr = ContextManager::new();
        let kind = mgr.define(64);
        let first = mgr.create(kind);
        let second = mgr.create(kind);
        assert_ne!(first, 0);
        assert_ne!(first, second);
    }
}
