//! Reference-counted heap with cycle collection
//!
//! `new_ref` allocates a cell at refcount 1. Ids are monotone and never
//! reused, which keeps weak references ABA-safe: a weak holds only the
//! target id and is valid exactly while that slot is still occupied.
//!
//! Cycle detection is color-based trial deletion (Bacon-Rajan): a
//! decrement that does not reach zero paints the cell purple and
//! buffers it as a candidate root. Collection marks candidate subgraphs
//! gray while removing internal counts, rescans to restore externally
//! reachable cells, and frees what stayed white. All phases run on
//! explicit worklists and are bounded by the candidate set.

use crate::value::{HeapId, Value, WeakId};
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Live, counts intact
    Black,
    /// Candidate cycle root (count decreased without reaching zero)
    Purple,
    /// Visited by trial deletion
    Gray,
    /// Provisionally garbage
    White,
}

#[derive(Debug)]
pub struct HeapObject {
    pub value: Value,
    pub rc: u32,
    color: Color,
    /// Function index of a destructor to run when the cell dies
    pub destructor: Option<u32>,
    /// Already sitting in the purple buffer
    buffered: bool,
}

/// Counters surfaced through the embedding API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub allocated: u64,
    pub freed: u64,
    pub live: u64,
    pub collections: u64,
    pub cycles_collected: u64,
}

/// A destructor the VM must invoke for a freed cell
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDestructor {
    pub func: u32,
    pub value: Value,
}

pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    /// weak id -> target heap id; descriptors are never reused
    weaks: Vec<HeapId>,
    purple: Vec<HeapId>,
    pub stats: GcStats,
    /// Run a cycle collection after this many decrements (0 = only on
    /// explicit CheckCycles)
    cycle_interval: u32,
    decrements: u32,
    /// Time budget for a frame-bounded collection
    frame_budget: Option<std::time::Duration>,
}

impl Heap {
    pub fn new(cycle_interval: u32) -> Self {
        Heap {
            slots: Vec::new(),
            weaks: Vec::new(),
            purple: Vec::new(),
            stats: GcStats::default(),
            cycle_interval,
            decrements: 0,
            frame_budget: None,
        }
    }

    pub fn get(&self, id: HeapId) -> Option<&HeapObject> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, id: HeapId) -> Option<&mut HeapObject> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    /// Mutable cell access for the VM's `SetRef`
    pub fn cell_mut(&mut self, id: HeapId) -> Option<&mut HeapObject> {
        self.get_mut(id)
    }

    pub fn alloc(&mut self, value: Value, destructor: Option<u32>) -> HeapId {
        let id = self.slots.len() as HeapId;
        self.slots.push(Some(HeapObject {
            value,
            rc: 1,
            color: Color::Black,
            destructor,
            buffered: false,
        }));
        self.stats.allocated += 1;
        self.stats.live += 1;
        trace!(id, "heap alloc");
        id
    }

    pub fn inc(&mut self, id: HeapId) {
        if let Some(obj) = self.get_mut(id) {
            obj.rc += 1;
            obj.color = Color::Black;
        }
    }

    /// Decrement; frees the cell (cascading into its children) on zero
    /// and buffers it as a cycle candidate otherwise. Returns any
    /// destructors the VM must now run.
    pub fn dec(&mut self, id: HeapId) -> Vec<PendingDestructor> {
        let mut pending = Vec::new();
        self.dec_inner(id, &mut pending);
        self.decrements += 1;
        if self.cycle_interval > 0 && self.decrements >= self.cycle_interval {
            self.decrements = 0;
            pending.extend(self.collect_cycles());
        }
        pending
    }

    fn dec_inner(&mut self, id: HeapId, pending: &mut Vec<PendingDestructor>) {
        // Worklist, not recursion: ref chains can be long
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(obj) = self.get_mut(id) else { continue };
            if obj.rc == 0 {
                continue;
            }
            obj.rc -= 1;
            if obj.rc == 0 {
                let obj = self.slots[id as usize].take().unwrap_or_else(|| unreachable!());
                if let Some(func) = obj.destructor {
                    pending.push(PendingDestructor {
                        func,
                        value: obj.value.clone(),
                    });
                }
                self.stats.freed += 1;
                self.stats.live = self.stats.live.saturating_sub(1);
                trace!(id, "heap free");
                let mut children = Vec::new();
                collect_children(&obj.value, &mut children);
                work.extend(children);
            } else {
                // Possible cycle root
                let buffered = obj.buffered;
                obj.color = Color::Purple;
                if !buffered {
                    obj.buffered = true;
                    self.purple.push(id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Weak references
    // ------------------------------------------------------------------

    /// Allocate a weak descriptor; the target's count is untouched
    pub fn new_weak(&mut self, target: HeapId) -> WeakId {
        let id = self.weaks.len() as WeakId;
        self.weaks.push(target);
        id
    }

    /// Promote a weak to a strong ref: bumps the target's count, or
    /// returns None when the target has been freed
    pub fn weak_to_strong(&mut self, weak: WeakId) -> Option<HeapId> {
        let target = *self.weaks.get(weak as usize)?;
        if self.get(target).is_some() {
            self.inc(target);
            Some(target)
        } else {
            None
        }
    }

    pub fn weak_target(&self, weak: WeakId) -> Option<HeapId> {
        let target = *self.weaks.get(weak as usize)?;
        self.get(target).map(|_| target)
    }

    // ------------------------------------------------------------------
    // Cycle collection
    // ------------------------------------------------------------------

    /// Whether enough candidates accumulated to make a collection pass
    /// worthwhile
    pub fn needs_collection(&self) -> bool {
        self.purple.len() >= 64
    }

    pub fn has_candidates(&self) -> bool {
        !self.purple.is_empty()
    }

    pub fn begin_frame(&mut self, budget_us: u64) {
        self.frame_budget = Some(std::time::Duration::from_micros(budget_us));
    }

    /// Full trial-deletion pass over the buffered candidates
    pub fn collect_cycles(&mut self) -> Vec<PendingDestructor> {
        if self.purple.is_empty() {
            return Vec::new();
        }
        let started = Instant::now();
        let budget = self.frame_budget.take();
        self.stats.collections += 1;

        let mut roots: Vec<HeapId> = Vec::new();
        while let Some(id) = self.purple.pop() {
            let Some(obj) = self.get_mut(id) else { continue };
            obj.buffered = false;
            if obj.color == Color::Purple {
                roots.push(id);
            }
            if let Some(b) = budget {
                if started.elapsed() > b {
                    // Out of budget: leave the rest buffered for the
                    // next frame
                    for rest in roots.iter().copied() {
                        if let Some(o) = self.get_mut(rest) {
                            o.buffered = true;
                        }
                    }
                    self.purple.extend(roots);
                    return Vec::new();
                }
            }
        }

        // Phase 1: trial-delete internal edges
        for &root in &roots {
            self.mark_gray(root);
        }
        // Phase 2: restore externally reachable subgraphs
        for &root in &roots {
            self.scan(root);
        }
        // Phase 3: free what stayed white
        let mut pending = Vec::new();
        let mut freed = 0u64;
        for &root in &roots {
            freed += self.collect_white(root, &mut pending);
        }
        if freed > 0 {
            debug!(freed, "cycle collector freed cells");
            self.stats.cycles_collected += freed;
        }
        pending
    }

    fn mark_gray(&mut self, root: HeapId) {
        let mut work = vec![root];
        while let Some(id) = work.pop() {
            let Some(obj) = self.get_mut(id) else { continue };
            if obj.color == Color::Gray {
                continue;
            }
            obj.color = Color::Gray;
            let mut children = Vec::new();
            collect_children(&obj.value, &mut children);
            for child in children {
                if let Some(c) = self.get_mut(child) {
                    c.rc = c.rc.saturating_sub(1);
                    work.push(child);
                }
            }
        }
    }

    fn scan(&mut self, root: HeapId) {
        let mut work = vec![root];
        while let Some(id) = work.pop() {
            let Some(obj) = self.get_mut(id) else { continue };
            if obj.color != Color::Gray {
                continue;
            }
            if obj.rc > 0 {
                self.scan_black(id);
            } else {
                obj.color = Color::White;
                let mut children = Vec::new();
                collect_children(&obj.value, &mut children);
                work.extend(children);
            }
        }
    }

    fn scan_black(&mut self, root: HeapId) {
        let mut work = vec![root];
        while let Some(id) = work.pop() {
            let Some(obj) = self.get_mut(id) else { continue };
            if obj.color == Color::Black {
                continue;
            }
            obj.color = Color::Black;
            let mut children = Vec::new();
            collect_children(&obj.value, &mut children);
            for child in children {
                if let Some(c) = self.get_mut(child) {
                    c.rc += 1;
                    if c.color != Color::Black {
                        work.push(child);
                    }
                }
            }
        }
    }

    fn collect_white(&mut self, root: HeapId, pending: &mut Vec<PendingDestructor>) -> u64 {
        let mut freed = 0;
        let mut work = vec![root];
        while let Some(id) = work.pop() {
            let is_white = self
                .get(id)
                .map(|o| o.color == Color::White)
                .unwrap_or(false);
            if !is_white {
                continue;
            }
            let obj = match self.slots[id as usize].take() {
                Some(o) => o,
                None => continue,
            };
            if let Some(func) = obj.destructor {
                pending.push(PendingDestructor {
                    func,
                    value: obj.value.clone(),
                });
            }
            freed += 1;
            self.stats.freed += 1;
            self.stats.live = self.stats.live.saturating_sub(1);
            let mut children = Vec::new();
            collect_children(&obj.value, &mut children);
            work.extend(children);
        }
        freed
    }

    /// Final teardown sweep at context free: every surviving cell is
    /// released unconditionally
    pub fn teardown(&mut self) -> u64 {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                freed += 1;
                self.stats.freed += 1;
                self.stats.live = self.stats.live.saturating_sub(1);
            }
        }
        self.purple.clear();
        freed
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Heap ids directly referenced by a value (one level; traversal is the
/// caller's worklist)
pub fn collect_children(value: &Value, out: &mut Vec<HeapId>) {
    match value {
        Value::Ref(id) => out.push(*id),
        Value::Array(items) => {
            for v in items.borrow().iter() {
                collect_children(v, out);
            }
        }
        Value::Table(t) => {
            for v in t.borrow().fields.values() {
                collect_children(v, out);
            }
        }
        Value::Some(v) | Value::Ok(v) | Value::Err(v) => collect_children(v, out),
        Value::Closure(c) => {
            for v in &c.captures {
                collect_children(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Table;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_rc_lifecycle() {
        let mut heap = Heap::new(0);
        let id = heap.alloc(Value::Int(5), None);
        assert_eq!(heap.get(id).unwrap().rc, 1);
        heap.inc(id);
        assert_eq!(heap.get(id).unwrap().rc, 2);
        heap.dec(id);
        assert!(heap.get(id).is_some());
        heap.dec(id);
        assert!(heap.get(id).is_none());
        assert_eq!(heap.stats.freed, 1);
    }

    #[test]
    fn test_cascading_free() {
        let mut heap = Heap::new(0);
        let inner = heap.alloc(Value::Int(1), None);
        let outer = heap.alloc(Value::Ref(inner), None);
        // inner's only count is the one from allocation; outer owns it
        heap.dec(outer);
        assert!(heap.get(outer).is_none());
        assert!(heap.get(inner).is_none());
    }

    #[test]
    fn test_weak_does_not_keep_alive() {
        let mut heap = Heap::new(0);
        let id = heap.alloc(Value::Int(7), None);
        let weak = heap.new_weak(id);
        heap.dec(id);
        assert!(heap.weak_to_strong(weak).is_none());
    }

    #[test]
    fn test_weak_to_strong_increments() {
        let mut heap = Heap::new(0);
        let id = heap.alloc(Value::Int(7), None);
        let weak = heap.new_weak(id);
        let strong = heap.weak_to_strong(weak).unwrap();
        assert_eq!(strong, id);
        assert_eq!(heap.get(id).unwrap().rc, 2);
    }

    fn table_with(field: &str, value: Value) -> Value {
        let mut fields = std::collections::HashMap::new();
        fields.insert(field.to_string(), value);
        Value::Table(Rc::new(RefCell::new(Table {
            type_name: "Node".into(),
            fields,
        })))
    }

    #[test]
    fn test_cycle_collection() {
        let mut heap = Heap::new(0);
        // a.next = b; b.next = a (two table cells referencing each other)
        let a = heap.alloc(table_with("next", Value::Nil), None);
        let b = heap.alloc(table_with("next", Value::Ref(a)), None);
        heap.inc(a); // b.next holds a
        if let Some(obj) = heap.get(a) {
            if let Value::Table(t) = &obj.value {
                t.borrow_mut().fields.insert("next".into(), Value::Ref(b));
            }
        }
        heap.inc(b); // a.next holds b

        // Drop both external handles; counts stay at 1 (the cycle)
        heap.dec(a);
        heap.dec(b);
        assert_eq!(heap.live_count(), 2);
        assert!(heap.has_candidates());

        heap.collect_cycles();
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.stats.cycles_collected, 2);
    }

    #[test]
    fn test_externally_held_cycle_survives() {
        let mut heap = Heap::new(0);
        let a = heap.alloc(table_with("next", Value::Nil), None);
        let b = heap.alloc(table_with("next", Value::Ref(a)), None);
        heap.inc(a);
        if let Some(obj) = heap.get(a) {
            if let Value::Table(t) = &obj.value {
                t.borrow_mut().fields.insert("next".into(), Value::Ref(b));
            }
        }
        heap.inc(b);
        // Drop only one external handle: a is still externally reachable
        heap.dec(b);
        heap.collect_cycles();
        assert_eq!(heap.live_count(), 2);
        // Counts must be restored for the survivors
        assert_eq!(heap.get(b).unwrap().rc, 1);
    }

    #[test]
    fn test_interval_triggers_collection() {
        let mut heap = Heap::new(2);
        let a = heap.alloc(table_with("next", Value::Nil), None);
        let b = heap.alloc(table_with("next", Value::Ref(a)), None);
        heap.inc(a);
        if let Some(obj) = heap.get(a) {
            if let Value::Table(t) = &obj.value {
                t.borrow_mut().fields.insert("next".into(), Value::Ref(b));
            }
        }
        heap.inc(b);
        heap.dec(a);
        heap.dec(b); // second decrement hits the interval
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_teardown_frees_everything() {
        let mut heap = Heap::new(0);
        heap.alloc(Value::Int(1), None);
        heap.alloc(Value::Int(2), None);
        assert_eq!(heap.teardown(), 2);
        assert_eq!(heap.stats.live, 0);
    }
}
