mod bus;
mod ids;
mod key;
mod ripple;
mod store;

pub use bus::{BusEvent, ChannelId, Emission, EventBus, HandlerId, ScopeId, Subscription};
pub use ids::{assign_event_ids, IdAllocator};
pub use key::Key;
pub use ripple::{Ripple, Slot};
pub use store::{Action, Controller, Store, StoreError, Updater};
