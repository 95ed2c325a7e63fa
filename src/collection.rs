/*!

An ordered, indexed set of models.

A [`Collection`] owns an ordered sequence of `Rc<Model>` members with O(1)
lookup by id and by client id, and keeps itself consistent as members come,
go, and change identity. Every member is wired with a delegated
subscription to its `"all"` event: the collection re-broadcasts member
events on its own channel, moves the id-index entry when a member's
identity changes, and drops the member when it is destroyed.

[`set`] is the general membership primitive — one pass that merges matching
input into existing members, removes members absent from the input, and
inserts the rest, with each leg individually switchable. `add`, `remove`,
and `reset` are expressed through it.

[`set`]: Collection::set

*/

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::rc::{Rc, Weak};

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::events::{Callback, Event, EventChannel};
use crate::model::{
    Attributes, Cid, Model, ModelOptions, SaveOptions, SetOptions as ModelSetOptions,
};
use crate::sync::{Completion, Method, SyncRequest, Transport};
use crate::value::{id_key, optional_value_cmp};

/// Constructs a member from raw attributes; lets a collection produce
/// application-specific models.
pub type ModelFactory = Rc<dyn Fn(Attributes, ModelOptions) -> Rc<Model>>;

/// The disjoint outcome lists carried by one `update` event.
#[derive(Clone, Default)]
pub struct Changes {
    pub added: Vec<Rc<Model>>,
    pub removed: Vec<Rc<Model>>,
    pub merged: Vec<Rc<Model>>,
}

/// The ordering a collection maintains: an attribute to sort by, a sort-key
/// extractor, or a two-argument total order.
pub enum Comparator {
    Attribute(String),
    Key(Box<dyn Fn(&Model) -> Value>),
    Order(Box<dyn Fn(&Model, &Model) -> CmpOrdering>),
}

/// One input to a membership operation: an existing model or raw
/// attributes to wrap via the configured factory.
pub enum Item {
    Model(Rc<Model>),
    Attrs(Attributes),
}

impl From<Rc<Model>> for Item {
    fn from(model: Rc<Model>) -> Item {
        Item::Model(model)
    }
}

impl From<Attributes> for Item {
    fn from(attrs: Attributes) -> Item {
        Item::Attrs(attrs)
    }
}

/// How to resolve a member: by raw id value, by client id, by model
/// reference, or by an attribute map's derived id.
pub enum Lookup<'a> {
    Id(&'a Value),
    Cid(Cid),
    Model(&'a Rc<Model>),
    Attrs(&'a Attributes),
}

/// A membership predicate: an attribute map every named attribute of which
/// must match, or an arbitrary predicate.
pub enum Matcher {
    Attrs(Attributes),
    Predicate(Box<dyn Fn(&Model) -> bool>),
}

impl Matcher {
    fn matches(&self, model: &Model) -> bool {
        match self {
            Matcher::Attrs(attrs) => attrs
                .iter()
                .all(|(attr, value)| model.get(attr).as_ref() == Some(value)),
            Matcher::Predicate(predicate) => predicate(model),
        }
    }
}

/// Options recognized by one membership operation.
#[derive(Clone)]
pub struct SetOptions {
    /// Insert input items that match no member.
    pub add: bool,
    /// Remove members absent from the input.
    pub remove: bool,
    /// Apply input attributes onto matching members.
    pub merge: bool,
    /// Splice insertions at this index instead of sorting; negative counts
    /// from the end, past-the-end clamps to append.
    pub at: Option<isize>,
    /// Re-sort after insertion when a comparator is configured.
    pub sort: bool,
    pub silent: bool,
    /// Run each member's validation; failing items are excluded without
    /// aborting the batch.
    pub validate: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        SetOptions {
            add: true,
            remove: true,
            merge: true,
            at: None,
            sort: true,
            silent: false,
            validate: false,
        }
    }
}

impl SetOptions {
    /// The `add` profile: insert unmatched items, never remove, never
    /// merge.
    #[must_use]
    pub fn adding() -> SetOptions {
        SetOptions {
            remove: false,
            merge: false,
            ..SetOptions::default()
        }
    }

    #[must_use]
    pub fn silent() -> SetOptions {
        SetOptions {
            silent: true,
            ..SetOptions::default()
        }
    }
}

/// Options recognized by `fetch`.
#[derive(Default)]
pub struct FetchOptions {
    /// Replace membership via `reset` instead of merging via `set`.
    pub reset: bool,
}

/// Options recognized by `create`.
#[derive(Default)]
pub struct CreateOptions {
    /// Defer insertion until the transport confirms the save.
    pub wait: bool,
}

/// Configuration injected at collection construction.
pub struct CollectionOptions {
    /// The id-attribute used to derive identity from raw attribute maps;
    /// also injected into members constructed here. Defaults to `"id"`.
    pub id_attribute: String,
    pub factory: Option<ModelFactory>,
    pub comparator: Option<Comparator>,
    pub transport: Option<Rc<dyn Transport>>,
    pub url: Option<String>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            id_attribute: "id".to_string(),
            factory: None,
            comparator: None,
            transport: None,
            url: None,
        }
    }
}

struct CollectionState {
    models: Vec<Rc<Model>>,
    by_id: FxHashMap<String, Rc<Model>>,
    by_cid: FxHashMap<Cid, Rc<Model>>,
}

/// An ordered sequence of models with O(1) identity lookup and aggregate
/// change notification.
pub struct Collection {
    channel: EventChannel,
    id_attribute: String,
    state: RefCell<CollectionState>,
    comparator: RefCell<Option<Comparator>>,
    factory: RefCell<Option<ModelFactory>>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    url: RefCell<Option<String>>,
    self_ref: Weak<Collection>,
    relay: Callback,
}

impl Collection {
    pub fn new(options: CollectionOptions) -> Rc<Collection> {
        Rc::new_cyclic(|weak: &Weak<Collection>| {
            let relay_ref = weak.clone();
            let relay: Callback = Rc::new(move |name: &str, event: &Event| {
                if let Some(collection) = relay_ref.upgrade() {
                    collection.on_member_event(name, event);
                }
            });
            Collection {
                channel: EventChannel::new(),
                id_attribute: options.id_attribute,
                state: RefCell::new(CollectionState {
                    models: Vec::new(),
                    by_id: FxHashMap::default(),
                    by_cid: FxHashMap::default(),
                }),
                comparator: RefCell::new(options.comparator),
                factory: RefCell::new(options.factory),
                transport: RefCell::new(options.transport),
                url: RefCell::new(options.url),
                self_ref: weak.clone(),
                relay,
            }
        })
    }

    /// Creates a collection and silently populates it with `items`.
    pub fn with_items(items: Vec<Item>, options: CollectionOptions) -> Rc<Collection> {
        let collection = Self::new(options);
        collection.reset(items, &SetOptions::silent());
        collection
    }

    #[must_use]
    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    #[must_use]
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.url.borrow().clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.borrow_mut() = Some(url.into());
    }

    pub fn set_transport(&self, transport: Rc<dyn Transport>) {
        *self.transport.borrow_mut() = Some(transport);
    }

    pub fn set_comparator(&self, comparator: Comparator) {
        *self.comparator.borrow_mut() = Some(comparator);
    }

    // ---- event surface, delegated to the channel ----

    pub fn on(&self, names: &str, callback: Callback) {
        self.channel.on(names, callback);
    }

    pub fn once(&self, names: &str, callback: Callback) {
        self.channel.once(names, callback);
    }

    pub fn off(&self, names: Option<&str>, callback: Option<&Callback>) {
        self.channel.off(names, callback);
    }

    pub fn trigger(&self, names: &str, event: &Event) {
        self.channel.trigger(names, event);
    }

    // ---- reads ----

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.borrow().models.is_empty()
    }

    #[must_use]
    pub fn at(&self, index: usize) -> Option<Rc<Model>> {
        self.state.borrow().models.get(index).cloned()
    }

    #[must_use]
    pub fn first(&self) -> Option<Rc<Model>> {
        self.at(0)
    }

    #[must_use]
    pub fn last(&self) -> Option<Rc<Model>> {
        let state = self.state.borrow();
        state.models.last().cloned()
    }

    /// A snapshot of the membership in order.
    #[must_use]
    pub fn models(&self) -> Vec<Rc<Model>> {
        self.state.borrow().models.clone()
    }

    /// Resolves a member; never constructs one.
    #[must_use]
    pub fn get(&self, lookup: Lookup) -> Option<Rc<Model>> {
        let state = self.state.borrow();
        match lookup {
            Lookup::Id(id) => state.by_id.get(&id_key(id)).cloned(),
            Lookup::Cid(cid) => state.by_cid.get(&cid).cloned(),
            Lookup::Model(model) => state.by_cid.get(&model.cid()).cloned().or_else(|| {
                model
                    .id()
                    .and_then(|id| state.by_id.get(&id_key(&id)).cloned())
            }),
            Lookup::Attrs(attrs) => attrs
                .get(&self.id_attribute)
                .filter(|value| !value.is_null())
                .and_then(|id| state.by_id.get(&id_key(id)).cloned()),
        }
    }

    #[must_use]
    pub fn get_by_id(&self, id: &Value) -> Option<Rc<Model>> {
        self.get(Lookup::Id(id))
    }

    /// The value of `attr` for every member, in order.
    #[must_use]
    pub fn pluck(&self, attr: &str) -> Vec<Option<Value>> {
        self.state
            .borrow()
            .models
            .iter()
            .map(|model| model.get(attr))
            .collect()
    }

    /// Every member the matcher accepts, in order.
    #[must_use]
    pub fn filter(&self, matcher: &Matcher) -> Vec<Rc<Model>> {
        self.state
            .borrow()
            .models
            .iter()
            .filter(|model| matcher.matches(model))
            .cloned()
            .collect()
    }

    /// The first member the matcher accepts.
    #[must_use]
    pub fn find(&self, matcher: &Matcher) -> Option<Rc<Model>> {
        self.state
            .borrow()
            .models
            .iter()
            .find(|model| matcher.matches(model))
            .cloned()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.models().iter().map(|model| model.to_json()).collect())
    }

    // ---- membership ----

    /// Adds items that match no member; never merges or removes. See
    /// [`Collection::set`].
    pub fn add(&self, items: Vec<Item>) -> Vec<Rc<Model>> {
        self.add_with(items, &SetOptions::adding())
    }

    /// As [`Collection::add`] with explicit options; the `add`/`remove`
    /// legs stay pinned to the add profile.
    pub fn add_with(&self, items: Vec<Item>, options: &SetOptions) -> Vec<Rc<Model>> {
        self.set(
            items,
            &SetOptions {
                add: true,
                remove: false,
                ..options.clone()
            },
        )
    }

    /// The general membership primitive. Matching input merges into
    /// existing members (`merge`), members absent from the input are
    /// removed (`remove`) before insertion, and unmatched input is
    /// inserted (`add`) — at the clamped `at` index when one is given,
    /// otherwise under the comparator's order. Returns the canonical
    /// member for each processed input, in input order.
    pub fn set(&self, items: Vec<Item>, options: &SetOptions) -> Vec<Rc<Model>> {
        let order_before: Vec<Cid> = self
            .state
            .borrow()
            .models
            .iter()
            .map(|model| model.cid())
            .collect();
        let sortable =
            options.sort && options.at.is_none() && self.comparator.borrow().is_some();
        let member_set_options = ModelSetOptions {
            unset: false,
            silent: options.silent,
            validate: options.validate,
        };

        let mut output: Vec<Rc<Model>> = Vec::new();
        let mut to_add: Vec<Rc<Model>> = Vec::new();
        let mut merged: Vec<Rc<Model>> = Vec::new();
        let mut retained: FxHashSet<Cid> = FxHashSet::default();
        // Resolves duplicate ids within this batch against the member
        // prepared earlier in the same pass.
        let mut batch_index: FxHashMap<String, Rc<Model>> = FxHashMap::default();

        for item in items {
            let existing = match &item {
                Item::Model(model) => self.get(Lookup::Model(model)),
                Item::Attrs(attrs) => self.get(Lookup::Attrs(attrs)),
            }
            .or_else(|| {
                self.item_id_key(&item)
                    .and_then(|key| batch_index.get(&key).cloned())
            });

            if let Some(existing) = existing {
                retained.insert(existing.cid());
                if options.merge {
                    let incoming = match &item {
                        Item::Model(model) if Rc::ptr_eq(model, &existing) => None,
                        Item::Model(model) => Some(model.attributes()),
                        Item::Attrs(attrs) => Some(attrs.clone()),
                    };
                    if let Some(attrs) = incoming {
                        // A rejected merge fires `invalid` through the
                        // member's own relay and is excluded; the batch
                        // continues.
                        if existing.set_with(attrs, &member_set_options).is_ok() {
                            merged.push(existing.clone());
                        }
                    }
                }
                output.push(existing);
            } else if options.add {
                let model = match item {
                    Item::Model(model) => Some(model),
                    Item::Attrs(attrs) => self.prepare_attrs(attrs, options.validate),
                };
                let Some(model) = model else { continue };
                retained.insert(model.cid());
                if let Some(id) = model.id() {
                    batch_index.insert(id_key(&id), model.clone());
                }
                to_add.push(model.clone());
                output.push(model);
            }
        }

        // Removal resolves first, so additions land in a consistent
        // structural view.
        let mut removed: Vec<Rc<Model>> = Vec::new();
        if options.remove {
            let stale: Vec<Rc<Model>> = self
                .state
                .borrow()
                .models
                .iter()
                .filter(|model| !retained.contains(&model.cid()))
                .cloned()
                .collect();
            removed = self.remove_models(&stale, options);
        }

        let mut insert_at: Option<usize> = None;
        if !to_add.is_empty() {
            {
                let mut state = self.state.borrow_mut();
                match options.at {
                    Some(at) => {
                        let at = clamp_index(at, state.models.len());
                        insert_at = Some(at);
                        for (offset, model) in to_add.iter().enumerate() {
                            state.models.insert(at + offset, model.clone());
                        }
                    }
                    None => state.models.extend(to_add.iter().cloned()),
                }
                for model in &to_add {
                    state.by_cid.insert(model.cid(), model.clone());
                    if let Some(id) = model.id() {
                        state.by_id.insert(id_key(&id), model.clone());
                    }
                }
            }
            for model in &to_add {
                self.add_reference(model);
            }
        }

        let mut resorted = false;
        if sortable && (!to_add.is_empty() || !merged.is_empty()) {
            self.sort_internal();
            let order_after: Vec<Cid> = self
                .state
                .borrow()
                .models
                .iter()
                .map(|model| model.cid())
                .collect();
            resorted = order_after != order_before;
        }

        if !options.silent {
            for (offset, model) in to_add.iter().enumerate() {
                model.trigger(
                    "add",
                    &Event::Add {
                        model: model.clone(),
                        collection: self.rc(),
                        index: insert_at.map(|at| at + offset),
                    },
                );
            }
            if resorted {
                self.channel
                    .trigger("sort", &Event::Sort { collection: self.rc() });
            }
            if !to_add.is_empty() || !removed.is_empty() || !merged.is_empty() {
                self.channel.trigger(
                    "update",
                    &Event::Update {
                        collection: self.rc(),
                        changes: Changes {
                            added: to_add.clone(),
                            removed,
                            merged,
                        },
                    },
                );
            }
        }
        output
    }

    /// Removes members matching the given models; a non-member is a silent
    /// no-op, reflected by its absence from the returned list.
    pub fn remove(&self, models: &[Rc<Model>], options: &SetOptions) -> Vec<Rc<Model>> {
        let canonical: Vec<Rc<Model>> = models
            .iter()
            .filter_map(|model| self.get(Lookup::Model(model)))
            .collect();
        let removed = self.remove_models(&canonical, options);
        if !options.silent && !removed.is_empty() {
            self.channel.trigger(
                "update",
                &Event::Update {
                    collection: self.rc(),
                    changes: Changes {
                        removed: removed.clone(),
                        ..Changes::default()
                    },
                },
            );
        }
        removed
    }

    pub fn remove_by_id(&self, id: &Value, options: &SetOptions) -> Option<Rc<Model>> {
        let model = self.get(Lookup::Id(id))?;
        self.remove(&[model], options).into_iter().next()
    }

    /// Replaces the whole membership: detaches every current member with
    /// no per-member events, silently adds `items`, then fires one `reset`
    /// carrying the previous members.
    pub fn reset(&self, items: Vec<Item>, options: &SetOptions) -> Vec<Rc<Model>> {
        let previous: Vec<Rc<Model>> = self.state.borrow().models.clone();
        for model in &previous {
            self.remove_reference(model);
        }
        {
            let mut state = self.state.borrow_mut();
            state.models.clear();
            state.by_id.clear();
            state.by_cid.clear();
        }
        let added = self.set(
            items,
            &SetOptions {
                add: true,
                remove: false,
                merge: false,
                silent: true,
                ..options.clone()
            },
        );
        if !options.silent {
            self.channel.trigger(
                "reset",
                &Event::Reset {
                    collection: self.rc(),
                    previous,
                },
            );
        }
        added
    }

    /// Appends an item (bypassing the comparator, as an explicit
    /// position).
    pub fn push(&self, item: Item) -> Option<Rc<Model>> {
        let at = self.len() as isize;
        self.add_with(
            vec![item],
            &SetOptions {
                at: Some(at),
                ..SetOptions::adding()
            },
        )
        .into_iter()
        .next()
    }

    /// Removes and returns the last member.
    pub fn pop(&self) -> Option<Rc<Model>> {
        let last = self.last()?;
        self.remove(&[last], &SetOptions::default()).into_iter().next()
    }

    /// Prepends an item (bypassing the comparator).
    pub fn unshift(&self, item: Item) -> Option<Rc<Model>> {
        self.add_with(
            vec![item],
            &SetOptions {
                at: Some(0),
                ..SetOptions::adding()
            },
        )
        .into_iter()
        .next()
    }

    /// Removes and returns the first member.
    pub fn shift(&self) -> Option<Rc<Model>> {
        let first = self.first()?;
        self.remove(&[first], &SetOptions::default()).into_iter().next()
    }

    /// Re-derives the order from the comparator.
    ///
    /// # Panics
    ///
    /// Panics when no comparator is configured.
    pub fn sort(&self, options: &SetOptions) {
        assert!(
            self.comparator.borrow().is_some(),
            "cannot sort a collection without a comparator"
        );
        self.sort_internal();
        if !options.silent {
            self.channel
                .trigger("sort", &Event::Sort { collection: self.rc() });
        }
    }

    // ---- transport ----

    /// Reads the collection's resource and applies the response: `set` by
    /// default, `reset` when asked.
    ///
    /// # Panics
    ///
    /// Panics when no transport or URL is configured.
    pub fn fetch(&self, options: &FetchOptions) {
        let transport = self
            .transport
            .borrow()
            .clone()
            .unwrap_or_else(|| panic!("a transport must be configured to sync"));
        let url = self
            .url
            .borrow()
            .clone()
            .unwrap_or_else(|| panic!("a url must be specified"));
        trace!("collection: read {url}");
        self.channel
            .trigger("request", &Event::Request { method: Method::Read });
        let collection = self.rc();
        let reset = options.reset;
        let success = move |response: Value| {
            let items: Vec<Item> = response
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| row.as_object().cloned().map(Item::Attrs))
                        .collect()
                })
                .unwrap_or_default();
            if reset {
                collection.reset(items, &SetOptions::default());
            } else {
                collection.set(items, &SetOptions::default());
            }
            collection
                .channel
                .trigger("sync", &Event::Sync { response });
        };
        let error_collection = self.rc();
        let error = move |response: Value| {
            error_collection
                .channel
                .trigger("error", &Event::TransportError { response });
        };
        transport.sync(
            Method::Read,
            SyncRequest { url, body: None },
            Completion::new(success, error),
        );
    }

    /// Constructs a member from `attrs`, saves it through the transport,
    /// and inserts it — immediately, or on transport success with `wait`.
    /// Returns `None` when construction-time validation rejects the
    /// attributes.
    pub fn create(&self, attrs: Attributes, options: &CreateOptions) -> Option<Rc<Model>> {
        let model = self.prepare_attrs(attrs, true)?;
        if options.wait {
            let collection_ref = self.self_ref.clone();
            let pending = model.clone();
            model.once(
                "sync",
                crate::events::callback(move |_name, _event| {
                    if let Some(collection) = collection_ref.upgrade() {
                        collection.add(vec![Item::Model(pending.clone())]);
                    }
                }),
            );
        } else {
            self.add(vec![Item::Model(model.clone())]);
        }
        let save_options = SaveOptions {
            wait: options.wait,
            ..SaveOptions::default()
        };
        if model.save(None, &save_options).is_err() {
            return None;
        }
        Some(model)
    }

    // ---- member wiring ----

    fn on_member_event(&self, name: &str, event: &Event) {
        match event {
            // Membership traffic from a different collection is not ours
            // to relay.
            Event::Add { collection, .. } | Event::Remove { collection, .. } => {
                if !Rc::ptr_eq(collection, &self.rc()) {
                    return;
                }
            }
            Event::Destroy { model, .. } => {
                self.remove(&[model.clone()], &SetOptions::default());
            }
            Event::Change { model, .. } => {
                // A gap here would silently break future id lookups.
                let previous_id = model.previous_id();
                let current_id = model.id();
                if previous_id != current_id {
                    let mut state = self.state.borrow_mut();
                    if let Some(previous) = &previous_id {
                        state.by_id.remove(&id_key(previous));
                    }
                    if let Some(current) = &current_id {
                        state.by_id.insert(id_key(current), model.clone());
                    }
                    trace!(
                        "collection: member {} reindexed {:?} -> {:?}",
                        model.cid(),
                        previous_id,
                        current_id
                    );
                }
            }
            _ => {}
        }
        self.channel.trigger(name, event);
    }

    fn item_id_key(&self, item: &Item) -> Option<String> {
        match item {
            Item::Model(model) => model.id().map(|id| id_key(&id)),
            Item::Attrs(attrs) => attrs
                .get(&self.id_attribute)
                .filter(|value| !value.is_null())
                .map(id_key),
        }
    }

    fn prepare_attrs(&self, attrs: Attributes, validate: bool) -> Option<Rc<Model>> {
        let options = ModelOptions {
            id_attribute: self.id_attribute.clone(),
            collection: Some(self.self_ref.clone()),
            transport: self.transport.borrow().clone(),
            validate,
            ..ModelOptions::default()
        };
        let model = match self.factory.borrow().as_ref() {
            Some(factory) => factory(attrs, options),
            None => Model::with_options(attrs, options),
        };
        if let Some(error) = model.validation_error() {
            self.channel.trigger("invalid", &Event::Invalid { error });
            return None;
        }
        Some(model)
    }

    fn add_reference(&self, model: &Rc<Model>) {
        if model.collection().is_none() {
            model.set_collection(&self.rc());
        }
        self.channel
            .listen_to(model.channel(), crate::events::ALL, self.relay.clone());
    }

    fn remove_reference(&self, model: &Rc<Model>) {
        if let Some(owner) = model.collection() {
            if Rc::ptr_eq(&owner, &self.rc()) {
                model.clear_collection();
            }
        }
        self.channel.stop_listening(Some(model.channel()), None, None);
    }

    /// Removes already-canonical members: indices first, then the
    /// per-member `remove` event, then the subscription teardown — so a
    /// reentrant removal from inside the event finds the member already
    /// gone.
    fn remove_models(&self, models: &[Rc<Model>], options: &SetOptions) -> Vec<Rc<Model>> {
        let mut removed = Vec::new();
        for model in models {
            let index = {
                let state = self.state.borrow();
                state
                    .models
                    .iter()
                    .position(|member| Rc::ptr_eq(member, model))
            };
            let Some(index) = index else { continue };
            {
                let mut state = self.state.borrow_mut();
                state.models.remove(index);
                state.by_cid.remove(&model.cid());
                if let Some(id) = model.id() {
                    state.by_id.remove(&id_key(&id));
                }
            }
            trace!("collection: removed member {} at {index}", model.cid());
            if !options.silent {
                model.trigger(
                    "remove",
                    &Event::Remove {
                        model: model.clone(),
                        collection: self.rc(),
                        index,
                    },
                );
            }
            self.remove_reference(model);
            removed.push(model.clone());
        }
        removed
    }

    fn sort_internal(&self) {
        let comparator = self.comparator.borrow();
        let Some(comparator) = comparator.as_ref() else {
            return;
        };
        // Sort outside the membership borrow so comparator closures may
        // read the collection.
        let mut models = self.state.borrow().models.clone();
        match comparator {
            Comparator::Attribute(attr) => models.sort_by(|a, b| {
                optional_value_cmp(a.get(attr).as_ref(), b.get(attr).as_ref())
            }),
            Comparator::Key(key) => models.sort_by(|a, b| {
                crate::value::value_cmp(&key(a), &key(b))
            }),
            Comparator::Order(order) => models.sort_by(|a, b| order(a, b)),
        }
        self.state.borrow_mut().models = models;
    }

    fn rc(&self) -> Rc<Collection> {
        self.self_ref.upgrade().expect("collection used after drop")
    }
}

fn clamp_index(at: isize, len: usize) -> usize {
    let len = len as isize;
    let at = if at < 0 { (len + at + 1).max(0) } else { at.min(len) };
    at as usize
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::events::callback;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn by_id_collection() -> Rc<Collection> {
        Collection::new(CollectionOptions::default())
    }

    fn count_events(collection: &Rc<Collection>, names: &str) -> Rc<RefCell<usize>> {
        let count = Rc::new(RefCell::new(0));
        let count_clone = count.clone();
        collection.on(
            names,
            callback(move |_name, _event| {
                *count_clone.borrow_mut() += 1;
            }),
        );
        count
    }

    fn ids(collection: &Collection) -> Vec<Value> {
        collection
            .models()
            .iter()
            .map(|model| model.id().unwrap_or(Value::Null))
            .collect()
    }

    #[test]
    fn add_and_get_by_every_scheme() {
        let collection = by_id_collection();
        let added = collection.add(vec![Item::Attrs(attrs(json!({"id": 1, "name": "ada"})))]);
        assert_eq!(added.len(), 1);
        let member = &added[0];

        assert!(Rc::ptr_eq(
            &collection.get_by_id(&json!(1)).unwrap(),
            member
        ));
        assert!(Rc::ptr_eq(
            &collection.get(Lookup::Cid(member.cid())).unwrap(),
            member
        ));
        assert!(Rc::ptr_eq(
            &collection.get(Lookup::Model(member)).unwrap(),
            member
        ));
        let probe = attrs(json!({"id": 1}));
        assert!(Rc::ptr_eq(
            &collection.get(Lookup::Attrs(&probe)).unwrap(),
            member
        ));
        // String keying: the numeric and string forms coincide.
        assert!(collection.get_by_id(&json!("1")).is_some());
        assert!(collection.get_by_id(&json!(2)).is_none());
    }

    #[test]
    fn duplicate_add_is_a_dedup_not_an_error() {
        let collection = by_id_collection();
        collection.add(vec![Item::Attrs(attrs(json!({"id": 1, "v": "a"})))]);
        let again = collection.add(vec![Item::Attrs(attrs(json!({"id": 1, "v": "b"})))]);
        assert_eq!(collection.len(), 1);
        // No merge under the add profile: the stored value is untouched,
        // but the canonical member is still returned.
        assert_eq!(again[0].get("v"), Some(json!("a")));
    }

    #[test]
    fn merge_updates_in_place_with_one_update_event() {
        let collection = by_id_collection();
        collection.add(vec![Item::Attrs(attrs(json!({"id": 1, "v": "a"})))]);

        let updates = Rc::new(RefCell::new(Vec::new()));
        let updates_clone = updates.clone();
        collection.on(
            "update",
            callback(move |_name, event| {
                if let Event::Update { changes, .. } = event {
                    updates_clone.borrow_mut().push((
                        changes.added.len(),
                        changes.removed.len(),
                        changes.merged.len(),
                    ));
                }
            }),
        );

        collection.set(
            vec![Item::Attrs(attrs(json!({"id": 1, "v": "b"})))],
            &SetOptions {
                remove: false,
                ..SetOptions::default()
            },
        );
        assert_eq!(collection.len(), 1);
        assert_eq!(
            collection.get_by_id(&json!(1)).unwrap().get("v"),
            Some(json!("b"))
        );
        assert_eq!(*updates.borrow(), vec![(0, 0, 1)]);
    }

    #[test]
    fn set_replaces_disjoint_content_with_per_item_events() {
        let collection = by_id_collection();
        collection.add(vec![
            Item::Attrs(attrs(json!({"id": 1}))),
            Item::Attrs(attrs(json!({"id": 2}))),
        ]);
        let add_count = count_events(&collection, "add");
        let remove_count = count_events(&collection, "remove");
        let update_count = count_events(&collection, "update");
        let reset_count = count_events(&collection, "reset");

        collection.set(
            vec![
                Item::Attrs(attrs(json!({"id": 3}))),
                Item::Attrs(attrs(json!({"id": 4}))),
            ],
            &SetOptions::default(),
        );

        assert_eq!(ids(&collection), vec![json!(3), json!(4)]);
        assert_eq!(*add_count.borrow(), 2);
        assert_eq!(*remove_count.borrow(), 2);
        assert_eq!(*update_count.borrow(), 1);
        assert_eq!(*reset_count.borrow(), 0);
    }

    #[test]
    fn reset_fires_exactly_one_reset_event() {
        let collection = by_id_collection();
        let a = Model::new(attrs(json!({"id": 1})));
        let b = Model::new(attrs(json!({"id": 2})));
        collection.add(vec![Item::Model(a.clone()), Item::Model(b.clone())]);

        let add_count = count_events(&collection, "add");
        let remove_count = count_events(&collection, "remove");
        let previous_seen = Rc::new(RefCell::new(Vec::new()));
        let previous_clone = previous_seen.clone();
        collection.on(
            "reset",
            callback(move |_name, event| {
                if let Event::Reset { previous, .. } = event {
                    previous_clone
                        .borrow_mut()
                        .extend(previous.iter().map(|model| model.cid()));
                }
            }),
        );

        collection.reset(
            vec![Item::Attrs(attrs(json!({"id": 9})))],
            &SetOptions::default(),
        );
        assert_eq!(ids(&collection), vec![json!(9)]);
        assert_eq!(*add_count.borrow(), 0);
        assert_eq!(*remove_count.borrow(), 0);
        assert_eq!(*previous_seen.borrow(), vec![a.cid(), b.cid()]);
        // The detached members no longer relay into this collection.
        a.set_attr("x", json!(1)).unwrap();
        assert!(a.collection().is_none());
    }

    #[test]
    fn remove_reports_pre_removal_index_and_skips_non_members() {
        let collection = by_id_collection();
        let added = collection.add(vec![
            Item::Attrs(attrs(json!({"id": 1}))),
            Item::Attrs(attrs(json!({"id": 2}))),
            Item::Attrs(attrs(json!({"id": 3}))),
        ]);

        let indexes = Rc::new(RefCell::new(Vec::new()));
        let indexes_clone = indexes.clone();
        collection.on(
            "remove",
            callback(move |_name, event| {
                if let Event::Remove { index, .. } = event {
                    indexes_clone.borrow_mut().push(*index);
                }
            }),
        );

        let stranger = Model::new(attrs(json!({"id": 99})));
        let removed = collection.remove(
            &[added[1].clone(), stranger],
            &SetOptions::default(),
        );
        assert_eq!(removed.len(), 1);
        assert_eq!(*indexes.borrow(), vec![1]);
        assert_eq!(ids(&collection), vec![json!(1), json!(3)]);
    }

    #[test]
    fn comparator_orders_members_and_sort_fires_on_later_add() {
        let comparator = Comparator::Order(Box::new(|a, b| {
            optional_value_cmp(a.get("id").as_ref(), b.get("id").as_ref())
        }));
        let collection = Collection::with_items(
            vec![
                Item::Attrs(attrs(json!({"id": 3}))),
                Item::Attrs(attrs(json!({"id": 1}))),
                Item::Attrs(attrs(json!({"id": 2}))),
            ],
            CollectionOptions {
                comparator: Some(comparator),
                ..CollectionOptions::default()
            },
        );
        assert_eq!(ids(&collection), vec![json!(1), json!(2), json!(3)]);

        // Construction was silent; only the explicit add may sort.
        let sort_count = count_events(&collection, "sort");
        collection.add(vec![Item::Attrs(attrs(json!({"id": 0})))]);
        assert_eq!(*sort_count.borrow(), 1);
        assert_eq!(
            ids(&collection),
            vec![json!(0), json!(1), json!(2), json!(3)]
        );
    }

    #[test]
    fn attribute_comparator_sorts_by_value() {
        let collection = Collection::with_items(
            vec![
                Item::Attrs(attrs(json!({"id": 1, "rank": 9}))),
                Item::Attrs(attrs(json!({"id": 2, "rank": 2}))),
                Item::Attrs(attrs(json!({"id": 3, "rank": 5}))),
            ],
            CollectionOptions {
                comparator: Some(Comparator::Attribute("rank".to_string())),
                ..CollectionOptions::default()
            },
        );
        assert_eq!(ids(&collection), vec![json!(2), json!(3), json!(1)]);
    }

    #[test]
    fn explicit_position_bypasses_the_comparator() {
        let collection = Collection::with_items(
            vec![
                Item::Attrs(attrs(json!({"id": 1}))),
                Item::Attrs(attrs(json!({"id": 2}))),
            ],
            CollectionOptions {
                comparator: Some(Comparator::Attribute("id".to_string())),
                ..CollectionOptions::default()
            },
        );
        collection.add_with(
            vec![Item::Attrs(attrs(json!({"id": 9})))],
            &SetOptions {
                at: Some(0),
                ..SetOptions::adding()
            },
        );
        assert_eq!(ids(&collection), vec![json!(9), json!(1), json!(2)]);

        // Negative positions count from the end; past-the-end appends.
        collection.add_with(
            vec![Item::Attrs(attrs(json!({"id": 8})))],
            &SetOptions {
                at: Some(-1),
                ..SetOptions::adding()
            },
        );
        assert_eq!(ids(&collection).last(), Some(&json!(8)));
        collection.add_with(
            vec![Item::Attrs(attrs(json!({"id": 7})))],
            &SetOptions {
                at: Some(100),
                ..SetOptions::adding()
            },
        );
        assert_eq!(ids(&collection).last(), Some(&json!(7)));
    }

    #[test]
    fn add_event_carries_requested_index() {
        let collection = by_id_collection();
        collection.add(vec![Item::Attrs(attrs(json!({"id": 1})))]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        collection.on(
            "add",
            callback(move |_name, event| {
                if let Event::Add { index, .. } = event {
                    seen_clone.borrow_mut().push(*index);
                }
            }),
        );
        collection.add(vec![Item::Attrs(attrs(json!({"id": 2})))]);
        collection.add_with(
            vec![Item::Attrs(attrs(json!({"id": 3})))],
            &SetOptions {
                at: Some(0),
                ..SetOptions::adding()
            },
        );
        assert_eq!(*seen.borrow(), vec![None, Some(0)]);
    }

    #[test]
    fn id_change_moves_the_index_entry() {
        let collection = by_id_collection();
        let added = collection.add(vec![Item::Attrs(attrs(json!({"id": 1})))]);
        let member = added[0].clone();

        member.set_attr("id", json!(2)).unwrap();
        assert!(collection.get_by_id(&json!(1)).is_none());
        assert!(Rc::ptr_eq(
            &collection.get_by_id(&json!(2)).unwrap(),
            &member
        ));
    }

    #[test]
    fn member_events_relay_on_the_collection_channel() {
        let collection = by_id_collection();
        let added = collection.add(vec![Item::Attrs(attrs(json!({"id": 1, "v": 0})))]);
        let change_count = count_events(&collection, "change:v");
        added[0].set_attr("v", json!(1)).unwrap();
        assert_eq!(*change_count.borrow(), 1);
    }

    #[test]
    fn destroyed_member_leaves_the_collection() {
        let collection = by_id_collection();
        let added = collection.add(vec![Item::Attrs(attrs(json!({"id": 1})))]);
        let remove_count = count_events(&collection, "remove");
        let destroy_count = count_events(&collection, "destroy");

        // A new-to-the-server model destroys locally.
        added[0].set_attr("id", json!(null)).unwrap();
        added[0].destroy(&crate::model::DestroyOptions::default());
        assert!(collection.is_empty());
        assert_eq!(*remove_count.borrow(), 1);
        assert_eq!(*destroy_count.borrow(), 1);
    }

    #[test]
    fn validation_failures_are_per_item() {
        let factory: ModelFactory = Rc::new(|attrs, mut options| {
            options.validator = Some(Box::new(|candidate| {
                candidate
                    .get("v")
                    .and_then(Value::as_i64)
                    .is_none_or(|v| v < 0)
                    .then(|| json!("v must be non-negative"))
            }));
            Model::with_options(attrs, options)
        });
        let collection = Collection::new(CollectionOptions {
            factory: Some(factory),
            ..CollectionOptions::default()
        });
        let invalid_count = count_events(&collection, "invalid");

        let added = collection.set(
            vec![
                Item::Attrs(attrs(json!({"id": 1, "v": 5}))),
                Item::Attrs(attrs(json!({"id": 2, "v": -1}))),
                Item::Attrs(attrs(json!({"id": 3, "v": 7}))),
            ],
            &SetOptions {
                validate: true,
                remove: false,
                ..SetOptions::default()
            },
        );
        // The failing item is excluded; the rest of the batch lands.
        assert_eq!(added.len(), 2);
        assert_eq!(ids(&collection), vec![json!(1), json!(3)]);
        assert_eq!(*invalid_count.borrow(), 1);
    }

    #[test]
    #[should_panic(expected = "without a comparator")]
    fn sorting_without_a_comparator_panics() {
        let collection = by_id_collection();
        collection.sort(&SetOptions::default());
    }

    #[test]
    fn pluck_filter_and_find() {
        let collection = by_id_collection();
        collection.add(vec![
            Item::Attrs(attrs(json!({"id": 1, "kind": "fruit", "name": "fig"}))),
            Item::Attrs(attrs(json!({"id": 2, "kind": "root", "name": "beet"}))),
            Item::Attrs(attrs(json!({"id": 3, "kind": "fruit", "name": "plum"}))),
        ]);

        assert_eq!(
            collection.pluck("name"),
            vec![Some(json!("fig")), Some(json!("beet")), Some(json!("plum"))]
        );
        let fruit = collection.filter(&Matcher::Attrs(attrs(json!({"kind": "fruit"}))));
        assert_eq!(fruit.len(), 2);
        let beet = collection
            .find(&Matcher::Predicate(Box::new(|model| {
                model.get("name") == Some(json!("beet"))
            })))
            .unwrap();
        assert_eq!(beet.id(), Some(json!(2)));
    }

    #[test]
    fn push_pop_shift_unshift() {
        let collection = by_id_collection();
        collection.push(Item::Attrs(attrs(json!({"id": 1}))));
        collection.push(Item::Attrs(attrs(json!({"id": 2}))));
        collection.unshift(Item::Attrs(attrs(json!({"id": 0}))));
        assert_eq!(ids(&collection), vec![json!(0), json!(1), json!(2)]);

        let popped = collection.pop().unwrap();
        assert_eq!(popped.id(), Some(json!(2)));
        let shifted = collection.shift().unwrap();
        assert_eq!(shifted.id(), Some(json!(0)));
        assert_eq!(ids(&collection), vec![json!(1)]);
    }

    #[test]
    fn duplicate_ids_within_one_batch_collapse() {
        let collection = by_id_collection();
        collection.set(
            vec![
                Item::Attrs(attrs(json!({"id": 1, "v": "first"}))),
                Item::Attrs(attrs(json!({"id": 1, "v": "second"}))),
            ],
            &SetOptions::default(),
        );
        assert_eq!(collection.len(), 1);
        // The later occurrence merged into the earlier one.
        assert_eq!(
            collection.get_by_id(&json!(1)).unwrap().get("v"),
            Some(json!("second"))
        );
    }

    struct FakeTransport {
        calls: RefCell<Vec<(Method, SyncRequest, Option<Completion>)>>,
    }

    impl FakeTransport {
        fn new() -> Rc<FakeTransport> {
            Rc::new(FakeTransport {
                calls: RefCell::new(Vec::new()),
            })
        }

        fn succeed(&self, index: usize, response: Value) {
            let completion = self.calls.borrow_mut()[index].2.take().unwrap();
            completion.succeed(response);
        }
    }

    impl Transport for FakeTransport {
        fn sync(&self, method: Method, request: SyncRequest, completion: Completion) {
            self.calls
                .borrow_mut()
                .push((method, request, Some(completion)));
        }
    }

    #[test]
    fn fetch_merges_or_resets_the_response() {
        let transport = FakeTransport::new();
        let collection = Collection::new(CollectionOptions {
            transport: Some(transport.clone()),
            url: Some("/rows".to_string()),
            ..CollectionOptions::default()
        });
        collection.add(vec![Item::Attrs(attrs(json!({"id": 1, "v": "stale"})))]);
        let sync_count = count_events(&collection, "sync");

        collection.fetch(&FetchOptions::default());
        assert_eq!(transport.calls.borrow()[0].0, Method::Read);
        assert_eq!(transport.calls.borrow()[0].1.url, "/rows");
        transport.succeed(0, json!([{"id": 1, "v": "fresh"}, {"id": 2, "v": "new"}]));
        assert_eq!(ids(&collection), vec![json!(1), json!(2)]);
        assert_eq!(
            collection.get_by_id(&json!(1)).unwrap().get("v"),
            Some(json!("fresh"))
        );
        assert_eq!(*sync_count.borrow(), 1);

        let reset_count = count_events(&collection, "reset");
        collection.fetch(&FetchOptions { reset: true });
        transport.succeed(1, json!([{"id": 9}]));
        assert_eq!(ids(&collection), vec![json!(9)]);
        assert_eq!(*reset_count.borrow(), 1);
    }

    #[test]
    fn create_waits_for_the_transport_when_asked() {
        let transport = FakeTransport::new();
        let collection = Collection::new(CollectionOptions {
            transport: Some(transport.clone()),
            url: Some("/rows".to_string()),
            ..CollectionOptions::default()
        });

        let eager = collection
            .create(attrs(json!({"v": "eager"})), &CreateOptions::default())
            .unwrap();
        assert_eq!(collection.len(), 1);
        transport.succeed(0, json!({"id": 1, "v": "eager"}));
        assert_eq!(eager.id(), Some(json!(1)));

        let waiting = collection
            .create(attrs(json!({"v": "waiting"})), &CreateOptions { wait: true })
            .unwrap();
        assert_eq!(collection.len(), 1);
        transport.succeed(1, json!({"id": 2, "v": "waiting"}));
        assert_eq!(collection.len(), 2);
        assert!(Rc::ptr_eq(
            &collection.get_by_id(&json!(2)).unwrap(),
            &waiting
        ));
    }
}
