use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Identifies one channel within a scope. Negative ids are reserved;
/// [`EventBus::CATCH_ALL`] is the only reserved id in use.
pub type ChannelId = i64;

/// Identifies one isolated handler namespace. The default scope is `0`.
pub type ScopeId = i64;

/// Identifies one registered handler. Ids are allocated monotonically, so
/// comparing two ids from the same bus orders their registrations.
pub type HandlerId = u64;

type Callback = Box<dyn Fn(&BusEvent)>;

struct HandlerRecord {
    callback: Callback,
    once: bool,
    /// Set when the handler is detached individually. Deliveries in flight
    /// hold on to their records, so a cleared registry alone does not stop
    /// them.
    removed: Cell<bool>,
}

type Registry = BTreeMap<ScopeId, BTreeMap<ChannelId, BTreeMap<HandlerId, Rc<HandlerRecord>>>>;

/// The normalized record delivered to every handler invocation.
///
/// `channel` always names the channel the emission targeted, so catch-all
/// handlers can tell the original addressee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// The channel the emission was addressed to.
    pub channel: ChannelId,

    /// The scope the emission was addressed to.
    pub scope: ScopeId,

    /// Caller-supplied dispatch context, opaque to the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    /// Arbitrary JSON payload. The bus does not interpret it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// One emission request, addressed to a channel with optional payload,
/// context, and dispatch flags.
///
/// ```
/// use ripplebus::Emission;
/// use serde_json::json;
///
/// let emission = Emission::new(7)
///     .with_payload(json!({ "delta": 1 }))
///     .prioritized();
/// assert_eq!(emission.channel, 7);
/// assert!(emission.prioritized);
/// ```
#[derive(Debug, Clone)]
pub struct Emission {
    pub channel: ChannelId,
    pub scope: ScopeId,
    pub payload: Option<Value>,
    pub context: Option<Value>,
    pub prioritized: bool,
    pub single_transaction: bool,
}

impl Emission {
    /// Address `channel` in the default scope with no payload.
    pub fn new(channel: ChannelId) -> Emission {
        Emission {
            channel,
            scope: 0,
            payload: None,
            context: None,
            prioritized: false,
            single_transaction: false,
        }
    }

    /// Address a scope other than the default.
    ///
    /// # Examples
    ///
    /// ```
    /// use ripplebus::Emission;
    ///
    /// let emission = Emission::new(7).with_scope(3);
    /// assert_eq!(emission.scope, 3);
    /// ```
    pub fn with_scope(mut self, scope: ScopeId) -> Emission {
        self.scope = scope;
        self
    }

    /// Attach a payload handed to every handler.
    ///
    /// # Examples
    ///
    /// ```
    /// use ripplebus::Emission;
    /// use serde_json::json;
    ///
    /// let emission = Emission::new(7).with_payload(json!({ "delta": 1 }));
    /// assert_eq!(emission.payload, Some(json!({ "delta": 1 })));
    /// ```
    pub fn with_payload(mut self, payload: Value) -> Emission {
        self.payload = Some(payload);
        self
    }

    /// Attach caller context handed to every handler.
    ///
    /// # Examples
    ///
    /// ```
    /// use ripplebus::Emission;
    /// use serde_json::json;
    ///
    /// let emission = Emission::new(7).with_context(json!("sync"));
    /// assert_eq!(emission.context, Some(json!("sync")));
    /// ```
    pub fn with_context(mut self, context: Value) -> Emission {
        self.context = Some(context);
        self
    }

    /// Deliver ahead of other queued emissions once the one currently
    /// being delivered finishes.
    pub fn prioritized(mut self) -> Emission {
        self.prioritized = true;
        self
    }

    /// Deliver to the single oldest-registered handler of the channel
    /// instead of the whole handler list. Channels without a handler are
    /// skipped silently.
    pub fn single_transaction(mut self) -> Emission {
        self.single_transaction = true;
        self
    }
}

/// Detaches one registered handler from its [`EventBus`].
///
/// Dropping a subscription does not remove the handler; call
/// [`Subscription::off`] to detach it. `off` is idempotent and is a no-op
/// after [`EventBus::clear`] or once the bus itself is gone.
#[derive(Debug)]
pub struct Subscription {
    id: HandlerId,
    scope: ScopeId,
    channel: ChannelId,
    handlers: Weak<RefCell<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove the handler. Returns whether it was still registered.
    pub fn off(&self) -> bool {
        let Some(handlers) = self.handlers.upgrade() else {
            return false;
        };
        let record = handlers
            .borrow_mut()
            .get_mut(&self.scope)
            .and_then(|channels| channels.get_mut(&self.channel))
            .and_then(|list| list.remove(&self.id));
        match record {
            Some(record) => {
                record.removed.set(true);
                trace!(
                    "detached handler {} from scope {} channel {}",
                    self.id, self.scope, self.channel
                );
                true
            }
            None => false,
        }
    }
}

/// A synchronous, priority-aware event dispatcher.
///
/// Handlers are keyed by scope and channel and invoked in registration
/// order. Emissions raised while a delivery is in flight are queued and
/// drained by the outermost [`emit`](EventBus::emit) call: plain emissions
/// in arrival order, prioritized emissions ahead of them, newest first.
///
/// ```
/// use ripplebus::{Emission, EventBus};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let bus = EventBus::new();
/// let seen = Rc::new(Cell::new(0));
/// let hits = seen.clone();
/// bus.on(7, move |event| hits.set(hits.get() + event.channel));
/// bus.emit(Emission::new(7));
/// bus.emit(Emission::new(7));
/// assert_eq!(seen.get(), 14);
/// ```
pub struct EventBus {
    handlers: Rc<RefCell<Registry>>,
    next_handler_id: Cell<HandlerId>,
    has_catch_all: Cell<bool>,
    queue: RefCell<Vec<Emission>>,
    queue_cursor: Cell<usize>,
    priority_queue: RefCell<Vec<Emission>>,
}

impl EventBus {
    /// Handlers registered on this channel receive every emission of their
    /// scope, after the channel's own handlers.
    pub const CATCH_ALL: ChannelId = -1;

    pub fn new() -> EventBus {
        EventBus {
            handlers: Rc::new(RefCell::new(BTreeMap::new())),
            next_handler_id: Cell::new(0),
            has_catch_all: Cell::new(false),
            queue: RefCell::new(Vec::new()),
            queue_cursor: Cell::new(0),
            priority_queue: RefCell::new(Vec::new()),
        }
    }

    /// Register `callback` for `channel` in the default scope.
    pub fn on<F>(&self, channel: ChannelId, callback: F) -> Subscription
    where
        F: Fn(&BusEvent) + 'static,
    {
        self.register(0, channel, false, callback)
    }

    /// Register `callback` for `channel` in the default scope, detached
    /// automatically after its first invocation.
    pub fn once<F>(&self, channel: ChannelId, callback: F) -> Subscription
    where
        F: Fn(&BusEvent) + 'static,
    {
        self.register(0, channel, true, callback)
    }

    /// Register `callback` for `channel` within `scope`.
    ///
    /// Handlers never observe the emission that is already being delivered
    /// when they are registered; they start receiving with the next one.
    pub fn register<F>(
        &self,
        scope: ScopeId,
        channel: ChannelId,
        once: bool,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&BusEvent) + 'static,
    {
        if channel == Self::CATCH_ALL {
            self.has_catch_all.set(true);
        }
        let id = self.next_handler_id.get();
        self.next_handler_id.set(id + 1);
        self.handlers
            .borrow_mut()
            .entry(scope)
            .or_default()
            .entry(channel)
            .or_default()
            .insert(
                id,
                Rc::new(HandlerRecord {
                    callback: Box::new(callback),
                    once,
                    removed: Cell::new(false),
                }),
            );
        trace!("registered handler {id} on scope {scope} channel {channel}");
        Subscription {
            id,
            scope,
            channel,
            handlers: Rc::downgrade(&self.handlers),
        }
    }

    /// Number of handlers currently registered for `channel` in `scope`.
    pub fn handler_count(&self, scope: ScopeId, channel: ChannelId) -> usize {
        self.handlers
            .borrow()
            .get(&scope)
            .and_then(|channels| channels.get(&channel))
            .map_or(0, |list| list.len())
    }

    /// Dispatch one emission.
    ///
    /// The call is synchronous: when it returns, every handler the emission
    /// (and any emissions raised by its handlers) reaches has run. Re-entrant
    /// calls enqueue and return; the outermost call owns the drain.
    pub fn emit(&self, emission: Emission) {
        trace!(
            "emit channel {} scope {} (prioritized: {}, single_transaction: {})",
            emission.channel, emission.scope, emission.prioritized, emission.single_transaction
        );
        {
            let mut queue = self.queue.borrow_mut();
            if emission.prioritized && !queue.is_empty() {
                self.priority_queue.borrow_mut().push(emission);
            } else {
                queue.push(emission);
            }
        }
        // A drain deeper in the call stack picks the item up.
        if self.queue.borrow().len() > 1 || self.priority_queue.borrow().len() > 1 {
            return;
        }
        loop {
            let next = match self.priority_queue.borrow_mut().pop() {
                Some(emission) => Some(emission),
                None => {
                    let queue = self.queue.borrow();
                    let cursor = self.queue_cursor.get();
                    if cursor < queue.len() {
                        self.queue_cursor.set(cursor + 1);
                        Some(queue[cursor].clone())
                    } else {
                        None
                    }
                }
            };
            let Some(emission) = next else { break };
            let event = BusEvent {
                channel: emission.channel,
                scope: emission.scope,
                context: emission.context,
                payload: emission.payload,
            };
            self.deliver(&event, emission.single_transaction);
            if self.queue_cursor.get() >= self.queue.borrow().len()
                && self.priority_queue.borrow().is_empty()
            {
                break;
            }
        }
        self.queue_cursor.set(0);
        self.queue.borrow_mut().clear();
    }

    /// Drop every handler and any queued emissions. A delivery already in
    /// flight keeps the handler list it captured and keeps running it.
    pub fn clear(&self) {
        self.handlers.borrow_mut().clear();
        self.has_catch_all.set(false);
        self.queue.borrow_mut().clear();
        self.queue_cursor.set(0);
        self.priority_queue.borrow_mut().clear();
        trace!("cleared all handlers and queues");
    }

    fn deliver(&self, event: &BusEvent, single_transaction: bool) {
        trace!("deliver channel {} scope {}", event.channel, event.scope);
        if single_transaction {
            let slot = {
                let handlers = self.handlers.borrow();
                handlers
                    .get(&event.scope)
                    .and_then(|channels| channels.get(&event.channel))
                    .and_then(|list| list.iter().next())
                    .map(|(id, record)| (*id, record.clone()))
            };
            let Some((id, record)) = slot else {
                trace!(
                    "skipped single-transaction emission on scope {} channel {}",
                    event.scope, event.channel
                );
                return;
            };
            (record.callback)(event);
            if record.once {
                self.remove(event.scope, event.channel, id);
            }
        } else {
            self.invoke_list(event.scope, event.channel, event);
        }
        if self.has_catch_all.get() && event.channel != Self::CATCH_ALL {
            self.invoke_list(event.scope, Self::CATCH_ALL, event);
        }
    }

    /// Invoke the channel's handlers against a snapshot of the list taken
    /// when delivery starts. Handlers detached individually mid-delivery
    /// are skipped; handlers added mid-delivery wait for the next emission;
    /// a clear does not stop the snapshot.
    fn invoke_list(&self, scope: ScopeId, channel: ChannelId, event: &BusEvent) {
        let snapshot: Vec<(HandlerId, Rc<HandlerRecord>)> = {
            let handlers = self.handlers.borrow();
            match handlers.get(&scope).and_then(|channels| channels.get(&channel)) {
                Some(list) => list
                    .iter()
                    .map(|(id, record)| (*id, record.clone()))
                    .collect(),
                None => return,
            }
        };
        for (id, record) in snapshot {
            if record.removed.get() {
                continue;
            }
            (record.callback)(event);
            if record.once {
                self.remove(scope, channel, id);
            }
        }
    }

    fn remove(&self, scope: ScopeId, channel: ChannelId, id: HandlerId) {
        let record = self
            .handlers
            .borrow_mut()
            .get_mut(&scope)
            .and_then(|channels| channels.get_mut(&channel))
            .and_then(|list| list.remove(&id));
        if let Some(record) = record {
            record.removed.set(true);
            trace!("detached one-shot handler {id} from scope {scope} channel {channel}");
        }
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: usize = self
            .handlers
            .borrow()
            .values()
            .flat_map(|channels| channels.values())
            .map(|list| list.len())
            .sum();
        f.debug_struct("EventBus")
            .field("handlers", &handlers)
            .field("queued", &self.queue.borrow().len())
            .field("prioritized", &self.priority_queue.borrow().len())
            .finish()
    }
}

