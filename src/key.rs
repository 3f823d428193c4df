use serde_json::Value;

/// A property key on a tracked value.
///
/// Keys address one slot of a structured value: a named field on a keyed
/// map, a position in a sequence, or the sequence-length pseudo-key that
/// stages truncation/extension the way a native length assignment would.
///
/// Conversions exist from `&str`, `String`, and `usize`, so call sites can
/// pass keys the way the tracked data is shaped:
///
/// ```
/// use ripplebus::Key;
///
/// assert_eq!(Key::from("title"), Key::Field("title".to_string()));
/// assert_eq!(Key::from(2), Key::Index(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// A named field on a keyed map.
    Field(String),
    /// A position in a sequence.
    Index(usize),
    /// The length pseudo-key of a sequence.
    Length,
}

impl Key {
    /// Normalize a key against the shape of the value it addresses.
    ///
    /// On sequence targets, a digits-only field becomes the corresponding
    /// index and `"length"` becomes [`Key::Length`], so `a["3"]` and `a[3]`
    /// land in the same slot. Keys on keyed-map targets pass through
    /// unchanged (a map may legitimately own a `length` field).
    pub(crate) fn normalized(self, sequence: bool) -> Key {
        if !sequence {
            return self;
        }
        match self {
            Key::Field(name) if name == "length" => Key::Length,
            Key::Field(name) => match name.parse::<usize>() {
                Ok(index) => Key::Index(index),
                Err(_) => Key::Field(name),
            },
            other => other,
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Key {
        Key::Field(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Key {
        Key::Field(name)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Key {
        Key::Index(index)
    }
}

/// True for values that get wrapped in child transactions.
pub(crate) fn is_structured(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

/// Walk `path` down from `root`, stopping at the first step that no longer
/// resolves (the sub-tree was structurally replaced since the path was
/// taken).
pub(crate) fn resolve<'a>(root: &'a Value, path: &[Key]) -> Option<&'a Value> {
    let mut node = root;
    for step in path {
        node = match (node, step) {
            (Value::Object(map), Key::Field(name)) => map.get(name)?,
            (Value::Array(items), Key::Index(index)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Mutable variant of [`resolve`].
pub(crate) fn resolve_mut<'a>(root: &'a mut Value, path: &[Key]) -> Option<&'a mut Value> {
    let mut node = root;
    for step in path {
        node = match (node, step) {
            (Value::Object(map), Key::Field(name)) => map.get_mut(name)?,
            (Value::Array(items), Key::Index(index)) => items.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Read one member of `target`. [`Key::Length`] is computed, not stored,
/// and is handled by the caller.
pub(crate) fn member<'a>(target: &'a Value, key: &Key) -> Option<&'a Value> {
    match (target, key) {
        (Value::Object(map), Key::Field(name)) => map.get(name),
        (Value::Array(items), Key::Index(index)) => items.get(*index),
        _ => None,
    }
}

/// Assign `value` into one slot of `target`.
///
/// Sequence semantics follow native assignment: an index past the end
/// extends the sequence with nulls, and a length assignment truncates or
/// null-extends. Key/shape mismatches (a named field against a sequence, a
/// non-numeric length) are silently skipped.
pub(crate) fn assign(target: &mut Value, key: &Key, value: Value) {
    match (target, key) {
        (Value::Object(map), Key::Field(name)) => {
            map.insert(name.clone(), value);
        }
        (Value::Array(items), Key::Index(index)) => {
            if *index >= items.len() {
                items.resize(*index + 1, Value::Null);
            }
            items[*index] = value;
        }
        (Value::Array(items), Key::Length) => {
            if let Some(len) = value.as_u64() {
                items.resize(len as usize, Value::Null);
            }
        }
        _ => {}
    }
}

