use crate::bus::{ChannelId, ScopeId};
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;

/// Allocates the opaque ids the rest of the crate keys on: channel ids for
/// field notifications and instance ids for consumer scopes.
///
/// Clones share one sequence, so every id handed out through any clone is
/// unique. The sequence starts at 1; `0` stays free as the unassigned
/// marker [`assign_event_ids`] replaces.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: Rc<Cell<i64>>,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        IdAllocator {
            next: Rc::new(Cell::new(1)),
        }
    }

    fn bump(&self) -> i64 {
        let id = self.next.get();
        self.next.set(id + 1);
        id
    }

    pub fn next_channel(&self) -> ChannelId {
        self.bump()
    }

    pub fn next_instance(&self) -> ScopeId {
        self.bump()
    }
}

impl Default for IdAllocator {
    fn default() -> IdAllocator {
        IdAllocator::new()
    }
}

/// Replace every `0` leaf of a nested keyed map with a freshly allocated
/// channel id.
///
/// Non-zero leaves and non-map, non-number values pass through unchanged,
/// so a map that already carries assigned ids comes back identical.
///
/// ```
/// use ripplebus::{assign_event_ids, IdAllocator};
/// use serde_json::json;
///
/// let ids = IdAllocator::new();
/// let assigned = assign_event_ids(&ids, json!({ "saved": 0, "custom": 41 }));
/// assert_ne!(assigned["saved"], json!(0));
/// assert_eq!(assigned["custom"], json!(41));
/// ```
pub fn assign_event_ids(ids: &IdAllocator, value: Value) -> Value {
    match value {
        Value::Object(entries) => {
            let mut assigned = serde_json::Map::with_capacity(entries.len());
            for (name, entry) in entries {
                assigned.insert(name, assign_event_ids(ids, entry));
            }
            Value::Object(assigned)
        }
        Value::Number(number) if number.as_i64() == Some(0) => Value::from(ids.next_channel()),
        other => other,
    }
}

