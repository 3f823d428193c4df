#![allow(dead_code)]

use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Order-sensitive tape of handler invocations.
pub fn tape() -> Rc<RefCell<Vec<i64>>> {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn marks(tape: &Rc<RefCell<Vec<i64>>>) -> Vec<i64> {
    tape.borrow().clone()
}

/// Shared invocation counter for handlers that only need to count.
pub fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

/// A small nested document exercising both maps and sequences.
pub fn nested_doc() -> Value {
    json!({
        "title": "draft",
        "meta": { "rev": 2, "tags": ["a", "b"] },
        "items": [1, 2, 3]
    })
}
