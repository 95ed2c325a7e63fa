/*!

Named-event subscription and synchronous dispatch.

Every observable object in this crate composes an [`EventChannel`] and
delegates its `on`/`off`/`trigger` surface to it. A channel keeps an
ordered list of subscriptions per event name; `trigger` invokes them in
subscription order, then invokes any wildcard (`"all"`) subscriptions with
the actual event name. Dispatch is strictly synchronous and single-threaded:
a callback may freely call back into `on`, `off`, `trigger`, or any model or
collection operation, because a snapshot of the callback list is taken
before dispatch and no interior borrow is held across a callback invocation.

Inversion-of-control subscription is available through
[`EventChannel::listen_to`]: the listening channel records which emitters it
is subscribed to, so `stop_listening()` with no arguments can sever every
such relationship at once. The bookkeeping is two-sided and reference
counted — removing a delegated subscription from the emitter (by any route,
including a one-shot firing or the emitter's own `off()`) also retires the
listener's record once its last subscription is gone.

*/

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::collection::{Changes, Collection};
use crate::model::{Model, SetOptions};
use crate::sync::Method;

/// The wildcard event name: a subscription to `"all"` is invoked for every
/// event fired on the channel.
pub const ALL: &str = "all";

/// Global channel counter; every channel gets a process-unique identity
/// used by the listening bookkeeping.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

/// The process-unique identity of one [`EventChannel`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ChannelId(u64);

/// The payload delivered to every callback alongside the event name.
///
/// Each variant carries what its event contract promises: the emitting
/// entity, the datum that changed, and where applicable the options that
/// governed the operation or the position it happened at. `Custom` carries
/// application-defined payloads for application-defined event names.
#[derive(Clone)]
pub enum Event {
    /// `change:<attr>` — one attribute changed; `value` is the new value,
    /// `None` when the attribute was unset.
    ChangeAttr {
        model: Rc<Model>,
        attr: String,
        value: Option<Value>,
        options: SetOptions,
    },
    /// `change` — the aggregate notification, once per pending round of a
    /// change cycle.
    Change { model: Rc<Model>, options: SetOptions },
    /// `invalid` — a validator rejected a proposed attribute set.
    Invalid { error: Value },
    /// `add` — the model entered the collection; `index` is the insertion
    /// position when one was requested explicitly.
    Add {
        model: Rc<Model>,
        collection: Rc<Collection>,
        index: Option<usize>,
    },
    /// `remove` — the model left the collection; `index` is its position
    /// immediately before removal.
    Remove {
        model: Rc<Model>,
        collection: Rc<Collection>,
        index: usize,
    },
    /// `update` — one batch operation finished; the three lists are
    /// disjoint.
    Update {
        collection: Rc<Collection>,
        changes: Changes,
    },
    /// `sort` — the collection re-derived its order.
    Sort { collection: Rc<Collection> },
    /// `reset` — bulk replacement; `previous` is the membership before the
    /// call, for diffing by observers.
    Reset {
        collection: Rc<Collection>,
        previous: Vec<Rc<Model>>,
    },
    /// `destroy` — the model is being discarded; `collection` is the set
    /// it still belonged to at that moment.
    Destroy {
        model: Rc<Model>,
        collection: Option<Rc<Collection>>,
    },
    /// `request` — a transport call is being dispatched.
    Request { method: Method },
    /// `sync` — the transport resolved successfully.
    Sync { response: Value },
    /// `error` — the transport failed; the payload is opaque.
    TransportError { response: Value },
    /// `route:<name>` / `route` — a router matched a fragment.
    Route { name: String, params: Vec<String> },
    /// Application-defined payload for application-defined events.
    Custom(Value),
}

/// The callback type for all subscriptions. The first argument is the name
/// of the event that fired, so a wildcard callback can tell events apart;
/// direct subscriptions are free to ignore it. Identity (for `off`
/// matching) is `Rc` pointer identity — keep a clone of the handle you
/// registered.
pub type Callback = Rc<dyn Fn(&str, &Event)>;

/// Wraps a closure into a [`Callback`] handle.
pub fn callback(f: impl Fn(&str, &Event) + 'static) -> Callback {
    Rc::new(f)
}

/// One registered subscription.
#[derive(Clone)]
struct Subscription {
    callback: Callback,
    /// Present on one-shot registrations; the shared flag keeps a reentrant
    /// re-trigger from firing the callback twice before it is unhooked.
    fired: Option<Rc<Cell<bool>>>,
    /// Present on delegated registrations: the listening channel, so its
    /// bookkeeping can be retired when this subscription goes away.
    listener: Option<ListenerRef>,
}

#[derive(Clone)]
struct ListenerRef {
    id: ChannelId,
    core: Weak<ChannelCore>,
}

/// The listener-side record of one emitter this channel listens to.
struct Listening {
    core: Weak<ChannelCore>,
    /// Number of live subscriptions this listener holds on the emitter.
    count: usize,
}

struct ChannelCore {
    id: ChannelId,
    handlers: RefCell<FxHashMap<String, Vec<Subscription>>>,
    listening_to: RefCell<FxHashMap<ChannelId, Listening>>,
}

/// A per-object registry of named-event subscriptions with synchronous,
/// reentrancy-safe dispatch.
#[derive(Clone)]
pub struct EventChannel {
    core: Rc<ChannelCore>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    #[must_use]
    pub fn new() -> EventChannel {
        EventChannel {
            core: Rc::new(ChannelCore {
                id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
                handlers: RefCell::new(FxHashMap::default()),
                listening_to: RefCell::new(FxHashMap::default()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.core.id
    }

    /// Registers `callback` for one or more space-separated event names.
    /// The literal name `"all"` subscribes to every event fired here.
    pub fn on(&self, names: &str, callback: Callback) {
        self.register(names, callback, false, None);
    }

    /// Registers several name→callback pairs at once.
    pub fn on_map<'a>(&self, entries: impl IntoIterator<Item = (&'a str, Callback)>) {
        for (names, callback) in entries {
            self.on(names, callback);
        }
    }

    /// As [`EventChannel::on`], but each listed event name gets its own
    /// independent one-shot registration: the callback fires at most once
    /// per name, then unhooks itself.
    pub fn once(&self, names: &str, callback: Callback) {
        self.register(names, callback, true, None);
    }

    /// Removes matching subscriptions. Omitting an argument widens the
    /// match; `off(None, None)` clears every subscription on this channel,
    /// retiring the bookkeeping of any channel listening to this one.
    pub fn off(&self, names: Option<&str>, callback: Option<&Callback>) {
        self.remove_matching(names, callback, None);
    }

    /// Synchronously invokes, in subscription order, every callback
    /// registered for each space-separated name, then every wildcard
    /// callback. The callback list is snapshotted before dispatch, so
    /// subscriptions added or removed by a callback do not affect the
    /// in-flight dispatch.
    pub fn trigger(&self, names: &str, event: &Event) {
        for name in names.split_whitespace() {
            self.trigger_one(name, event);
        }
    }

    /// Subscribes to `other`, recording the relationship on *this* channel
    /// so that [`EventChannel::stop_listening`] can sever it without a
    /// reference to `other`.
    pub fn listen_to(&self, other: &EventChannel, names: &str, callback: Callback) {
        self.track_listening(other, names.split_whitespace().count());
        other.register(names, callback, false, Some(self.listener_ref()));
    }

    /// As [`EventChannel::listen_to`], one-shot per listed event name.
    pub fn listen_to_once(&self, other: &EventChannel, names: &str, callback: Callback) {
        self.track_listening(other, names.split_whitespace().count());
        other.register(names, callback, true, Some(self.listener_ref()));
    }

    /// Removes delegated subscriptions this channel holds. With no emitter
    /// given, every emitter this channel has ever listened to is covered.
    pub fn stop_listening(
        &self,
        other: Option<&EventChannel>,
        names: Option<&str>,
        callback: Option<&Callback>,
    ) {
        let targets: Vec<(ChannelId, Weak<ChannelCore>)> = match other {
            Some(channel) => vec![(channel.core.id, Rc::downgrade(&channel.core))],
            None => self
                .core
                .listening_to
                .borrow()
                .iter()
                .map(|(id, listening)| (*id, listening.core.clone()))
                .collect(),
        };
        for (id, weak) in targets {
            match weak.upgrade() {
                Some(core) => {
                    EventChannel { core }.remove_matching(names, callback, Some(self.core.id));
                }
                None => {
                    // Emitter dropped; only our side of the record is left.
                    self.core.listening_to.borrow_mut().remove(&id);
                }
            }
        }
    }

    fn listener_ref(&self) -> ListenerRef {
        ListenerRef {
            id: self.core.id,
            core: Rc::downgrade(&self.core),
        }
    }

    fn track_listening(&self, other: &EventChannel, count: usize) {
        if count == 0 {
            return;
        }
        let mut listening = self.core.listening_to.borrow_mut();
        let entry = listening.entry(other.core.id).or_insert_with(|| Listening {
            core: Rc::downgrade(&other.core),
            count: 0,
        });
        entry.count += count;
    }

    fn register(&self, names: &str, callback: Callback, once: bool, listener: Option<ListenerRef>) {
        let mut handlers = self.core.handlers.borrow_mut();
        for name in names.split_whitespace() {
            trace!("channel {:?}: subscribing to {name}", self.core.id);
            handlers
                .entry(name.to_string())
                .or_default()
                .push(Subscription {
                    callback: callback.clone(),
                    // One flag per name: a multi-name one-shot fires once
                    // per listed event, not once total.
                    fired: once.then(|| Rc::new(Cell::new(false))),
                    listener: listener.clone(),
                });
        }
    }

    fn trigger_one(&self, name: &str, event: &Event) {
        let (direct, wildcard) = {
            let handlers = self.core.handlers.borrow();
            (
                handlers.get(name).cloned().unwrap_or_default(),
                if name == ALL {
                    Vec::new()
                } else {
                    handlers.get(ALL).cloned().unwrap_or_default()
                },
            )
        };
        if direct.is_empty() && wildcard.is_empty() {
            return;
        }
        trace!("channel {:?}: triggering {name}", self.core.id);
        self.dispatch(name, &direct, name, event);
        self.dispatch(ALL, &wildcard, name, event);
    }

    fn dispatch(&self, registered: &str, subscriptions: &[Subscription], name: &str, event: &Event) {
        for subscription in subscriptions {
            if let Some(fired) = &subscription.fired {
                if fired.replace(true) {
                    continue;
                }
                // Unhook before invoking, so the callback observes itself
                // already gone.
                self.remove_one_shot(registered, fired);
            }
            (subscription.callback)(name, event);
        }
    }

    fn remove_one_shot(&self, registered: &str, fired: &Rc<Cell<bool>>) {
        let mut removed = Vec::new();
        {
            let mut handlers = self.core.handlers.borrow_mut();
            if let Some(list) = handlers.get_mut(registered) {
                let mut index = 0;
                while index < list.len() {
                    let matches = list[index]
                        .fired
                        .as_ref()
                        .is_some_and(|flag| Rc::ptr_eq(flag, fired));
                    if matches {
                        removed.push(list.remove(index));
                    } else {
                        index += 1;
                    }
                }
                if list.is_empty() {
                    handlers.remove(registered);
                }
            }
        }
        self.retire_listeners(&removed);
    }

    fn remove_matching(
        &self,
        names: Option<&str>,
        callback: Option<&Callback>,
        listener: Option<ChannelId>,
    ) {
        let mut removed = Vec::new();
        {
            let mut handlers = self.core.handlers.borrow_mut();
            let keys: Vec<String> = match names {
                Some(names) => names.split_whitespace().map(str::to_string).collect(),
                None => handlers.keys().cloned().collect(),
            };
            for key in keys {
                let Some(list) = handlers.get_mut(&key) else {
                    continue;
                };
                let mut kept = Vec::with_capacity(list.len());
                for subscription in list.drain(..) {
                    let callback_matches = callback
                        .is_none_or(|handle| Rc::ptr_eq(handle, &subscription.callback));
                    let listener_matches = listener.is_none_or(|id| {
                        subscription
                            .listener
                            .as_ref()
                            .is_some_and(|listener_ref| listener_ref.id == id)
                    });
                    if callback_matches && listener_matches {
                        removed.push(subscription);
                    } else {
                        kept.push(subscription);
                    }
                }
                if kept.is_empty() {
                    handlers.remove(&key);
                } else {
                    handlers.insert(key, kept);
                }
            }
        }
        trace!(
            "channel {:?}: removed {} subscription(s)",
            self.core.id,
            removed.len()
        );
        self.retire_listeners(&removed);
    }

    /// Retires the listener-side bookkeeping of removed delegated
    /// subscriptions. Refcount reaching zero drops the listener's record
    /// for this emitter entirely.
    fn retire_listeners(&self, removed: &[Subscription]) {
        for subscription in removed {
            let Some(listener) = &subscription.listener else {
                continue;
            };
            let Some(listener_core) = listener.core.upgrade() else {
                continue;
            };
            let mut listening = listener_core.listening_to.borrow_mut();
            if let Some(entry) = listening.get_mut(&self.core.id) {
                entry.count = entry.count.saturating_sub(1);
                if entry.count == 0 {
                    listening.remove(&self.core.id);
                }
            }
        }
    }
}
