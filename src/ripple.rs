use crate::bus::{ChannelId, Emission, EventBus};
use crate::key::{self, Key};
use indexmap::IndexMap;
use log::debug;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

/// The result of reading one key through a transaction.
#[derive(Debug, Clone)]
pub enum Slot {
    /// A live child transaction over a nested structured value.
    Ripple(Ripple),
    /// A plain value, staged or drawn from the underlying target.
    Value(Value),
    /// Nothing lives at the key.
    Missing,
}

impl Slot {
    pub fn into_ripple(self) -> Option<Ripple> {
        match self {
            Slot::Ripple(ripple) => Some(ripple),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Slot::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Slot::Missing)
    }
}

/// A write staged in the overlay: either a plain value or an adopted
/// transaction whose committed target becomes the value.
enum Staged {
    Plain(Value),
    Proxy(Ripple),
}

/// What one read resolved to once overlay and child cache both missed.
enum Resolved {
    Child,
    Plain(Value),
    Absent,
}

struct Node {
    /// Shared tree the transaction family writes into on commit.
    root: Rc<RefCell<Value>>,
    /// Steps from the tree root down to this transaction's target.
    path: Vec<Key>,
    /// Staged writes, in first-write order.
    overlay: IndexMap<Key, Staged>,
    /// Child transactions handed out for nested structured values.
    children: IndexMap<Key, Ripple>,
    /// Every child node ever spawned per key, cached or evicted. A commit
    /// that overwrites a key severs the handles recorded under it.
    spawned: IndexMap<Key, Vec<Weak<RefCell<Node>>>>,
    channel: ChannelId,
    bus: Rc<EventBus>,
    /// Set once a committed replacement cut this node out of the tree.
    detached: bool,
}

impl Node {
    fn target_is_sequence(&self) -> bool {
        if self.detached {
            return false;
        }
        let root = self.root.borrow();
        matches!(key::resolve(&root, &self.path), Some(Value::Array(_)))
    }
}

/// A transaction over a structured value.
///
/// Writes are staged in an overlay and become visible to reads through the
/// same transaction immediately, while the underlying value stays untouched
/// until [`commit`](Ripple::commit). Reading a nested structured value
/// yields a child transaction; the family commits and cancels as a unit
/// from any member downward.
///
/// Cloning a `Ripple` clones a handle, not the transaction: both handles
/// stage into the same overlay.
///
/// ```
/// use ripplebus::{EventBus, Ripple};
/// use serde_json::json;
/// use std::rc::Rc;
///
/// let bus = Rc::new(EventBus::new());
/// let ripple = Ripple::new(json!({ "title": "draft", "tags": ["a"] }), 3, bus);
///
/// ripple.set("title", "final");
/// assert_eq!(ripple.target()["title"], json!("draft"));
///
/// ripple.commit();
/// assert_eq!(ripple.target()["title"], json!("final"));
/// ```
#[derive(Clone)]
pub struct Ripple {
    node: Rc<RefCell<Node>>,
}

impl Ripple {
    /// Start a transaction over `initial`, announcing commits on `channel`.
    pub fn new(initial: Value, channel: ChannelId, bus: Rc<EventBus>) -> Ripple {
        Ripple::over(Rc::new(RefCell::new(initial)), channel, bus)
    }

    /// Start a transaction over an already-shared tree cell.
    pub(crate) fn over(root: Rc<RefCell<Value>>, channel: ChannelId, bus: Rc<EventBus>) -> Ripple {
        Ripple {
            node: Rc::new(RefCell::new(Node {
                root,
                path: Vec::new(),
                overlay: IndexMap::new(),
                children: IndexMap::new(),
                spawned: IndexMap::new(),
                channel,
                bus,
                detached: false,
            })),
        }
    }

    fn spawn(&self, key: Key) -> Ripple {
        let child = {
            let node = self.node.borrow();
            let mut path = node.path.clone();
            path.push(key.clone());
            Ripple {
                node: Rc::new(RefCell::new(Node {
                    root: node.root.clone(),
                    path,
                    overlay: IndexMap::new(),
                    children: IndexMap::new(),
                    spawned: IndexMap::new(),
                    channel: node.channel,
                    bus: node.bus.clone(),
                    detached: false,
                })),
            }
        };
        let mut node = self.node.borrow_mut();
        let lineage = node.spawned.entry(key).or_default();
        lineage.retain(|weak| weak.strong_count() > 0);
        lineage.push(Rc::downgrade(&child.node));
        child
    }

    /// Cut off every handle spawned for `key`, recursively. Runs when a
    /// commit overwrites or truncates the key's slot.
    fn sever(&self, key: &Key) {
        let lineage = self.node.borrow_mut().spawned.shift_remove(key);
        for weak in lineage.into_iter().flatten() {
            if let Some(node) = weak.upgrade() {
                Ripple { node }.detach_lineage();
            }
        }
    }

    fn detach_lineage(&self) {
        let descendants: Vec<Weak<RefCell<Node>>> = {
            let mut node = self.node.borrow_mut();
            if node.detached {
                return;
            }
            node.detached = true;
            node.spawned.values().flatten().cloned().collect()
        };
        for weak in descendants {
            if let Some(node) = weak.upgrade() {
                Ripple { node }.detach_lineage();
            }
        }
    }

    /// The channel this transaction announces its commits on. Children
    /// inherit it unchanged.
    pub fn channel(&self) -> ChannelId {
        self.node.borrow().channel
    }

    /// A snapshot of the underlying target, without staged writes. Yields
    /// null when the target was detached by a structural replacement.
    pub fn target(&self) -> Value {
        let node = self.node.borrow();
        if node.detached {
            return Value::Null;
        }
        let root = node.root.borrow();
        key::resolve(&root, &node.path).cloned().unwrap_or(Value::Null)
    }

    /// Read one key.
    ///
    /// Resolution order: the child cache, then the overlay, then the
    /// underlying target. A structured target value is wrapped in a child
    /// transaction and cached, so repeated reads share one child. Staged
    /// values are returned as they were written. On sequence targets,
    /// digits-only keys address positions and `"length"` reads the staged
    /// or current length. A detached transaction still reads its staged
    /// values but resolves nothing else.
    pub fn get(&self, key: impl Into<Key>) -> Slot {
        let key = {
            let node = self.node.borrow();
            let key = key.into().normalized(node.target_is_sequence());
            if let Some(child) = node.children.get(&key) {
                return Slot::Ripple(child.clone());
            }
            if let Some(staged) = node.overlay.get(&key) {
                return match staged {
                    Staged::Plain(value) => Slot::Value(value.clone()),
                    Staged::Proxy(ripple) => Slot::Ripple(ripple.clone()),
                };
            }
            key
        };
        let resolved = {
            let node = self.node.borrow();
            if node.detached {
                return Slot::Missing;
            }
            let root = node.root.borrow();
            let target = key::resolve(&root, &node.path);
            match (&key, target) {
                (Key::Length, Some(Value::Array(items))) => {
                    Resolved::Plain(Value::from(items.len() as u64))
                }
                (_, Some(target)) => match key::member(target, &key) {
                    Some(value) if key::is_structured(value) => Resolved::Child,
                    Some(value) => Resolved::Plain(value.clone()),
                    None => Resolved::Absent,
                },
                (_, None) => Resolved::Absent,
            }
        };
        match resolved {
            Resolved::Child => {
                let child = self.spawn(key.clone());
                self.node.borrow_mut().children.insert(key, child.clone());
                Slot::Ripple(child)
            }
            Resolved::Plain(value) => Slot::Value(value),
            Resolved::Absent => Slot::Missing,
        }
    }

    /// Read one key, keeping only a child transaction.
    pub fn child(&self, key: impl Into<Key>) -> Option<Ripple> {
        self.get(key).into_ripple()
    }

    /// Stage `value` at `key`.
    ///
    /// A child transaction previously handed out for the key is evicted
    /// together with its pending writes; the staged value wins at commit.
    /// Until that commit the evicted handle still addresses the live
    /// value; once the replacement lands it is detached for good.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) {
        let mut node = self.node.borrow_mut();
        let key = key.into().normalized(node.target_is_sequence());
        node.children.shift_remove(&key);
        node.overlay.insert(key, Staged::Plain(value.into()));
    }

    /// Adopt another transaction at `key`.
    ///
    /// If a child is cached for the key the adopted transaction replaces it
    /// there, dropping the child's pending writes; it then commits and
    /// cancels with this family, against its own target. Otherwise it is
    /// staged in the overlay and its committed target becomes the value at
    /// `key` on the next commit.
    pub fn set_ripple(&self, key: impl Into<Key>, ripple: &Ripple) {
        let mut node = self.node.borrow_mut();
        let key = key.into().normalized(node.target_is_sequence());
        if node.children.contains_key(&key) {
            node.children.insert(key, ripple.clone());
        } else {
            node.overlay.insert(key, Staged::Proxy(ripple.clone()));
        }
    }

    /// Flush staged writes into the underlying tree and announce the commit
    /// on this transaction's channel.
    ///
    /// Staged writes land in first-write order, then child transactions
    /// whose keys were not overwritten commit recursively. The whole family
    /// produces a single notification. Overwriting or truncating a key
    /// detaches every child handle previously handed out for it; writes
    /// through a detached handle are skipped silently.
    pub fn commit(&self) {
        self.apply(false);
    }

    fn apply(&self, suppress_notification: bool) {
        let (root, path, overlay, children, channel, bus, detached) = {
            let mut node = self.node.borrow_mut();
            (
                node.root.clone(),
                node.path.clone(),
                mem::take(&mut node.overlay),
                mem::take(&mut node.children),
                node.channel,
                node.bus.clone(),
                node.detached,
            )
        };
        let staged_keys: Vec<Key> = overlay.keys().cloned().collect();
        let child_count = children.len();
        for (key, staged) in overlay {
            let concrete = match staged {
                Staged::Plain(value) => value,
                Staged::Proxy(ripple) => {
                    ripple.apply(true);
                    ripple.target()
                }
            };
            self.sever(&key);
            if detached {
                continue;
            }
            let shrunk = {
                let mut tree = root.borrow_mut();
                match key::resolve_mut(&mut tree, &path) {
                    Some(target) => {
                        let length_before = target.as_array().map(|items| items.len());
                        key::assign(target, &key, concrete);
                        match (&key, length_before, target.as_array()) {
                            (Key::Length, Some(before), Some(after)) if after.len() < before => {
                                Some((after.len(), before))
                            }
                            _ => None,
                        }
                    }
                    None => None,
                }
            };
            if let Some((new_length, old_length)) = shrunk {
                for index in new_length..old_length {
                    self.sever(&Key::Index(index));
                }
            }
        }
        for (key, child) in children {
            if staged_keys.contains(&key) {
                continue;
            }
            child.apply(true);
        }
        if !suppress_notification {
            debug!(
                "committed {} staged writes and {} children on channel {channel}",
                staged_keys.len(),
                child_count
            );
            bus.emit(Emission::new(channel));
        }
    }

    /// Discard staged writes, recursively through adopted transactions and
    /// children. The underlying value is untouched and nothing is emitted.
    pub fn cancel(&self) {
        let (overlay, children) = {
            let mut node = self.node.borrow_mut();
            (mem::take(&mut node.overlay), mem::take(&mut node.children))
        };
        for staged in overlay.into_values() {
            if let Staged::Proxy(ripple) = staged {
                ripple.cancel();
            }
        }
        for child in children.into_values() {
            child.cancel();
        }
    }
}

impl fmt::Debug for Ripple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node.borrow();
        f.debug_struct("Ripple")
            .field("channel", &node.channel)
            .field("path", &node.path)
            .field("staged", &node.overlay.len())
            .field("children", &node.children.len())
            .finish()
    }
}

