use crate::bus::{BusEvent, ChannelId, Emission, EventBus, Subscription};
use crate::ids::IdAllocator;
use crate::ripple::Ripple;
use indexmap::IndexMap;
use log::debug;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Errors surfaced by the field registry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The registry only tracks keyed maps at the top level.
    #[error("initial value must be a keyed map")]
    NotAnObject,
    /// The field was not part of the initial value.
    #[error("unknown field `{0}`")]
    UnknownField(String),
}

/// What to do with a field once an update handler or controller has looked
/// at its transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Flush staged writes into the live value and notify subscribers.
    Commit,
    /// Discard staged writes. The live value stays put and nobody is
    /// notified.
    Restore,
    /// Put the pristine copy of the field back and notify subscribers.
    Reset,
    /// Install a replacement live value and notify subscribers. `None`
    /// degrades to [`Action::Reset`].
    Replace(Option<Value>),
}

struct FieldSlot {
    channel: ChannelId,
    /// Cell every transaction over this field writes into. Reset and
    /// replace install a fresh cell, leaving older transactions detached.
    live: Rc<RefCell<Value>>,
    pristine: Value,
    tx: Option<Ripple>,
}

struct Inner {
    bus: Rc<EventBus>,
    ids: IdAllocator,
    fields: RefCell<IndexMap<String, FieldSlot>>,
}

impl Inner {
    fn with_slot<T>(&self, field: &str, read: impl FnOnce(&FieldSlot) -> T) -> Result<T, StoreError> {
        let fields = self.fields.borrow();
        let slot = fields
            .get(field)
            .ok_or_else(|| StoreError::UnknownField(field.to_string()))?;
        Ok(read(slot))
    }

    /// Cancel-or-create: reuse the field's cached transaction with pending
    /// writes discarded, or start a fresh one over the live cell.
    fn acquire(&self, field: &str) -> Result<Ripple, StoreError> {
        let mut fields = self.fields.borrow_mut();
        let slot = fields
            .get_mut(field)
            .ok_or_else(|| StoreError::UnknownField(field.to_string()))?;
        if let Some(tx) = &slot.tx {
            tx.cancel();
            return Ok(tx.clone());
        }
        let tx = Ripple::over(slot.live.clone(), slot.channel, self.bus.clone());
        slot.tx = Some(tx.clone());
        Ok(tx)
    }

    /// Install `value` as the field's fresh live cell, drop the cached
    /// transaction, and notify the field's channel.
    fn install(&self, field: &str, value: Value) -> Result<(), StoreError> {
        let channel = {
            let mut fields = self.fields.borrow_mut();
            let slot = fields
                .get_mut(field)
                .ok_or_else(|| StoreError::UnknownField(field.to_string()))?;
            slot.live = Rc::new(RefCell::new(value));
            slot.tx = None;
            slot.channel
        };
        // No registry borrow may be held here: handlers read the store.
        self.bus.emit(Emission::new(channel));
        Ok(())
    }

    fn perform(&self, field: &str, tx: &Ripple, action: Action) -> Result<(), StoreError> {
        match action {
            Action::Commit => {
                tx.commit();
                Ok(())
            }
            Action::Restore => {
                tx.cancel();
                Ok(())
            }
            Action::Reset | Action::Replace(None) => {
                let pristine = self.with_slot(field, |slot| slot.pristine.clone())?;
                debug!("reset field `{field}`");
                self.install(field, pristine)
            }
            Action::Replace(Some(value)) => {
                debug!("replaced field `{field}`");
                self.install(field, value)
            }
        }
    }
}

/// A registry of independently tracked fields over one shared bus.
///
/// Each top-level field of the initial value gets its own notification
/// channel and its own transaction lifecycle; committing one field never
/// disturbs another. The store is a cheaply cloneable handle.
///
/// ```
/// use ripplebus::{Action, Store};
/// use serde_json::json;
///
/// let store = Store::new(json!({ "counter": { "count": 0 } })).unwrap();
/// let updater = store.updater("counter").unwrap();
///
/// updater.apply(|tx| {
///     tx.set("count", 1);
///     Action::Commit
/// });
/// assert_eq!(store.value("counter").unwrap(), json!({ "count": 1 }));
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Rc<Inner>,
}

impl Store {
    /// Build a registry over `initial`, which must be a keyed map. A fresh
    /// bus and id allocator are created.
    pub fn new(initial: Value) -> Result<Store, StoreError> {
        Store::with_parts(initial, Rc::new(EventBus::new()), IdAllocator::new())
    }

    /// Build a registry over `initial` with an externally owned bus and id
    /// allocator, so several stores can share one dispatch domain.
    pub fn with_parts(
        initial: Value,
        bus: Rc<EventBus>,
        ids: IdAllocator,
    ) -> Result<Store, StoreError> {
        let Value::Object(source) = initial else {
            return Err(StoreError::NotAnObject);
        };
        let mut fields = IndexMap::with_capacity(source.len());
        for (name, value) in source {
            let channel = ids.next_channel();
            debug!("tracking field `{name}` on channel {channel}");
            fields.insert(
                name,
                FieldSlot {
                    channel,
                    pristine: value.clone(),
                    live: Rc::new(RefCell::new(value)),
                    tx: None,
                },
            );
        }
        Ok(Store {
            inner: Rc::new(Inner {
                bus,
                ids,
                fields: RefCell::new(fields),
            }),
        })
    }

    /// The bus field notifications are dispatched on.
    pub fn bus(&self) -> &Rc<EventBus> {
        &self.inner.bus
    }

    /// The allocator this store draws its ids from. Binding layers use it
    /// to mint instance ids for their own consumers.
    pub fn ids(&self) -> &IdAllocator {
        &self.inner.ids
    }

    /// The notification channel assigned to `field`. Stable for the life
    /// of the store.
    pub fn channel(&self, field: &str) -> Result<ChannelId, StoreError> {
        self.inner.with_slot(field, |slot| slot.channel)
    }

    /// A snapshot of the field's live value, without staged writes.
    pub fn value(&self, field: &str) -> Result<Value, StoreError> {
        self.inner.with_slot(field, |slot| slot.live.borrow().clone())
    }

    /// Invoke `callback` every time the field commits, resets, or is
    /// replaced.
    pub fn subscribe<F>(&self, field: &str, callback: F) -> Result<Subscription, StoreError>
    where
        F: Fn(&BusEvent) + 'static,
    {
        let channel = self.channel(field)?;
        Ok(self.inner.bus.on(channel, callback))
    }

    /// The field's transaction plus a controller that settles it.
    ///
    /// Acquiring a field that already has a cached transaction discards its
    /// pending writes and hands the same transaction back, so concurrent
    /// observers share one staging area.
    pub fn observe(&self, field: &str) -> Result<(Ripple, Controller), StoreError> {
        let tx = self.inner.acquire(field)?;
        Ok((
            tx.clone(),
            Controller {
                inner: self.inner.clone(),
                field: field.to_string(),
                tx,
            },
        ))
    }

    /// An updater bound to `field`, for the run-handler-then-settle flow.
    pub fn updater(&self, field: &str) -> Result<Updater, StoreError> {
        let tx = self.inner.acquire(field)?;
        Ok(Updater {
            inner: self.inner.clone(),
            field: field.to_string(),
            tx: RefCell::new(tx),
        })
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<String> = self.inner.fields.borrow().keys().cloned().collect();
        f.debug_struct("Store").field("fields", &fields).finish()
    }
}

/// Settles the transaction captured by [`Store::observe`].
pub struct Controller {
    inner: Rc<Inner>,
    field: String,
    tx: Ripple,
}

impl Controller {
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Apply `action` to the observed field.
    pub fn apply(&self, action: Action) {
        if let Err(err) = self.inner.perform(&self.field, &self.tx, action) {
            debug!("controller action on `{}` dropped: {err}", self.field);
        }
    }
}

/// Runs update handlers against one field's cached transaction.
///
/// [`apply`](Updater::apply) hands the transaction to a handler and settles
/// it according to the returned [`Action`]. After a reset or replacement
/// the updater re-acquires a transaction over the fresh live cell, so the
/// returned handle always reads current state.
pub struct Updater {
    inner: Rc<Inner>,
    field: String,
    tx: RefCell<Ripple>,
}

impl Updater {
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The field's transaction, with any pending writes discarded for a
    /// clean read. Nothing is committed and nobody is notified.
    pub fn ripple(&self) -> Ripple {
        self.refresh();
        self.tx.borrow().clone()
    }

    /// Run `handler` against the field's transaction, then settle according
    /// to the action it returns. The handle returned reflects the outcome:
    /// the same transaction after a commit or restore, a fresh one over the
    /// new live value after a reset or replacement.
    pub fn apply<F>(&self, handler: F) -> Ripple
    where
        F: FnOnce(&Ripple) -> Action,
    {
        let tx = self.tx.borrow().clone();
        let action = handler(&tx);
        let reacquire = matches!(action, Action::Reset | Action::Replace(_));
        if let Err(err) = self.inner.perform(&self.field, &tx, action) {
            debug!("update action on `{}` dropped: {err}", self.field);
        }
        if reacquire {
            self.refresh();
        }
        self.tx.borrow().clone()
    }

    fn refresh(&self) {
        if let Ok(tx) = self.inner.acquire(&self.field) {
            *self.tx.borrow_mut() = tx;
        }
    }
}

