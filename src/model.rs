/*!

The observable attribute store.

A [`Model`] is a named-attribute bag mutated exclusively through [`set`],
which diffs proposed values against current state, applies them, and
notifies subscribers: one `change:<attr>` event per attribute that changed,
then one aggregate `change` event per pending round of the change cycle.
A change cycle spans from the outermost `set` call until no further pending
changes remain — a handler that calls `set` again contributes to the same
cycle (same `previous_attributes` snapshot, same `changed` bookkeeping)
rather than starting a new one, and the outermost call drains the queued
aggregate notifications before returning.

Models are handled as `Rc<Model>` and use interior mutability; no internal
borrow is ever held across a callback invocation, so handlers are free to
call back into this model, its collection, or anything else on the thread.

[`set`]: Model::set

*/

use std::cell::RefCell;
use std::fmt::{self, Display};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use log::trace;
use serde_json::{Map, Value};

use crate::collection::Collection;
use crate::error::TetherError;
use crate::events::{Callback, Event, EventChannel};
use crate::sync::{Completion, Method, SyncRequest, Transport};
use crate::value::id_key;

/// The attribute map. Insertion order is preserved for iteration.
pub type Attributes = Map<String, Value>;

/// A validation predicate over the candidate merged attribute set. Returns
/// `Some(error)` to reject; the payload is opaque to the engine.
pub type Validator = Box<dyn Fn(&Attributes) -> Option<Value>>;

/// Translates a raw transport response into attributes. The default takes
/// the response's object form, or nothing if it has none.
pub type ParseFn = Rc<dyn Fn(&Value) -> Attributes>;

/// Global client-id counter.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier assigned to every model at construction,
/// stable for the model's lifetime. Identifies a model before (and after)
/// a server-assigned id exists.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Cid(u64);

impl Cid {
    fn next() -> Cid {
        Cid(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Options recognized by one `set` call.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Apply the proposed attributes as deletions instead of assignments.
    pub unset: bool,
    /// Suppress all notification.
    pub silent: bool,
    /// Run the validator before applying; rejection aborts the whole call.
    pub validate: bool,
}

impl SetOptions {
    #[must_use]
    pub fn silent() -> SetOptions {
        SetOptions {
            silent: true,
            ..SetOptions::default()
        }
    }

    #[must_use]
    pub fn validated() -> SetOptions {
        SetOptions {
            validate: true,
            ..SetOptions::default()
        }
    }
}

/// Options recognized by `save`.
pub struct SaveOptions {
    /// Defer local attribute application until the transport succeeds.
    pub wait: bool,
    /// Send only the supplied attributes, with the `patch` method.
    pub patch: bool,
    pub validate: bool,
    pub silent: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            wait: false,
            patch: false,
            // Unlike plain `set`, saving validates unless told otherwise.
            validate: true,
            silent: false,
        }
    }
}

/// Options recognized by `destroy`.
#[derive(Default)]
pub struct DestroyOptions {
    /// Defer the local destroy notification until the transport succeeds.
    pub wait: bool,
}

/// Configuration injected at model construction.
pub struct ModelOptions {
    /// Which attribute carries the identity. Defaults to `"id"`.
    pub id_attribute: String,
    pub validator: Option<Validator>,
    pub parse: Option<ParseFn>,
    pub transport: Option<Rc<dyn Transport>>,
    pub url_root: Option<String>,
    /// Validate the initial attributes; on rejection the model is created
    /// empty with `validation_error` set.
    pub validate: bool,
    /// The owning collection's back-reference, injected when a collection
    /// constructs members from raw attributes.
    pub collection: Option<Weak<Collection>>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        ModelOptions {
            id_attribute: "id".to_string(),
            validator: None,
            parse: None,
            transport: None,
            url_root: None,
            validate: false,
            collection: None,
        }
    }
}

struct ModelState {
    attributes: Attributes,
    /// Snapshot of `attributes` taken at the start of the current change
    /// cycle.
    previous: Attributes,
    /// Attribute → new value (`None` = unset) for every attribute whose
    /// current value differs from `previous`. Survives nested sets within
    /// one cycle; cleared when a new cycle starts.
    changed: IndexMap<String, Option<Value>>,
    /// Derived from the id-attribute; `None` while absent or null.
    id: Option<Value>,
    validation_error: Option<Value>,
    collection: Option<Weak<Collection>>,
    /// A `set` call is on the stack.
    changing: bool,
    /// An aggregate `change` notification is owed; holds the options of
    /// the set that most recently produced changes.
    pending: Option<SetOptions>,
}

/// An observable key-value store with change tracking.
pub struct Model {
    cid: Cid,
    id_attribute: String,
    channel: EventChannel,
    state: RefCell<ModelState>,
    validator: RefCell<Option<Validator>>,
    parse: RefCell<Option<ParseFn>>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    url_root: RefCell<Option<String>>,
    self_ref: Weak<Model>,
}

impl Model {
    /// Creates a model holding `attrs`, with default configuration.
    pub fn new(attrs: Attributes) -> Rc<Model> {
        Self::with_options(attrs, ModelOptions::default())
    }

    pub fn with_options(attrs: Attributes, options: ModelOptions) -> Rc<Model> {
        let model = Rc::new_cyclic(|weak| Model {
            cid: Cid::next(),
            id_attribute: options.id_attribute,
            channel: EventChannel::new(),
            state: RefCell::new(ModelState {
                attributes: Attributes::new(),
                previous: Attributes::new(),
                changed: IndexMap::new(),
                id: None,
                validation_error: None,
                collection: options.collection,
                changing: false,
                pending: None,
            }),
            validator: RefCell::new(options.validator),
            parse: RefCell::new(options.parse),
            transport: RefCell::new(options.transport),
            url_root: RefCell::new(options.url_root),
            self_ref: weak.clone(),
        });
        let initial = SetOptions {
            silent: true,
            validate: options.validate,
            unset: false,
        };
        let _ = model.set_with(attrs, &initial);
        model.state.borrow_mut().changed.clear();
        model
    }

    #[must_use]
    pub fn cid(&self) -> Cid {
        self.cid
    }

    #[must_use]
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    /// The current identity value, if the id-attribute is present and
    /// non-null.
    #[must_use]
    pub fn id(&self) -> Option<Value> {
        self.state.borrow().id.clone()
    }

    /// True iff no identity is defined — the model has never been
    /// persisted.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.borrow().id.is_none()
    }

    #[must_use]
    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    /// The owning collection, while one holds this model.
    #[must_use]
    pub fn collection(&self) -> Option<Rc<Collection>> {
        self.state.borrow().collection.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_collection(&self, collection: &Rc<Collection>) {
        self.state.borrow_mut().collection = Some(Rc::downgrade(collection));
    }

    pub(crate) fn clear_collection(&self) {
        self.state.borrow_mut().collection = None;
    }

    pub fn set_validator(&self, validator: Validator) {
        *self.validator.borrow_mut() = Some(validator);
    }

    pub fn set_transport(&self, transport: Rc<dyn Transport>) {
        *self.transport.borrow_mut() = Some(transport);
    }

    pub fn set_url_root(&self, url_root: impl Into<String>) {
        *self.url_root.borrow_mut() = Some(url_root.into());
    }

    #[must_use]
    pub fn get(&self, attr: &str) -> Option<Value> {
        self.state.borrow().attributes.get(attr).cloned()
    }

    #[must_use]
    pub fn has(&self, attr: &str) -> bool {
        self.state.borrow().attributes.contains_key(attr)
    }

    /// A snapshot of the current attributes.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.state.borrow().attributes.clone()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.attributes())
    }

    /// The last validation failure payload, until the next validation run.
    #[must_use]
    pub fn validation_error(&self) -> Option<Value> {
        self.state.borrow().validation_error.clone()
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

    // ---- the set algorithm ----

    /// Sets attributes with default options. See [`Model::set_with`].
    pub fn set(&self, attrs: Attributes) -> Result<(), TetherError> {
        self.set_with(attrs, &SetOptions::default())
    }

    /// Sets a single attribute.
    pub fn set_attr(&self, attr: &str, value: Value) -> Result<(), TetherError> {
        let mut attrs = Attributes::new();
        attrs.insert(attr.to_string(), value);
        self.set_with(attrs, &SetOptions::default())
    }

    /// Applies `attrs`, diffing against current state and notifying
    /// subscribers unless `silent`. On validation rejection nothing is
    /// applied and `Err(Validation)` is returned.
    pub fn set_with(&self, attrs: Attributes, options: &SetOptions) -> Result<(), TetherError> {
        let proposed: Vec<(String, Option<Value>)> = if options.unset {
            attrs.into_iter().map(|(attr, _)| (attr, None)).collect()
        } else {
            attrs
                .into_iter()
                .map(|(attr, value)| (attr, Some(value)))
                .collect()
        };
        self.apply(proposed, options)
    }

    /// Deletes one attribute, as a `set` with `unset`.
    pub fn unset(&self, attr: &str, options: &SetOptions) -> Result<(), TetherError> {
        self.apply(
            vec![(attr.to_string(), None)],
            &SetOptions {
                unset: true,
                ..options.clone()
            },
        )
    }

    /// Deletes every attribute, as a `set` with `unset`.
    pub fn clear(&self, options: &SetOptions) -> Result<(), TetherError> {
        let proposed = self
            .state
            .borrow()
            .attributes
            .keys()
            .map(|attr| (attr.clone(), None))
            .collect();
        self.apply(
            proposed,
            &SetOptions {
                unset: true,
                ..options.clone()
            },
        )
    }

    fn apply(
        &self,
        proposed: Vec<(String, Option<Value>)>,
        options: &SetOptions,
    ) -> Result<(), TetherError> {
        if options.validate {
            self.validate_proposed(&proposed)?;
        }

        let mut changes: Vec<String> = Vec::new();
        let was_changing;
        {
            let mut state = self.state.borrow_mut();
            was_changing = state.changing;
            state.changing = true;
            if !was_changing {
                state.previous = state.attributes.clone();
                state.changed.clear();
            }
            for (attr, value) in proposed {
                if state.attributes.get(&attr) != value.as_ref() {
                    changes.push(attr.clone());
                }
                // Net change is judged against the cycle's snapshot: an
                // attribute that round-trips back to its previous value
                // leaves the changed map again.
                if state.previous.get(&attr) != value.as_ref() {
                    state.changed.insert(attr.clone(), value.clone());
                } else {
                    state.changed.shift_remove(&attr);
                }
                match value {
                    Some(value) => {
                        state.attributes.insert(attr, value);
                    }
                    None => {
                        state.attributes.remove(&attr);
                    }
                }
            }
            // Keep the derived id consistent before any observer runs.
            state.id = state
                .attributes
                .get(&self.id_attribute)
                .filter(|value| !value.is_null())
                .cloned();
            if !options.silent && !changes.is_empty() {
                state.pending = Some(options.clone());
            }
        }

        if !options.silent {
            for attr in &changes {
                let value = self.get(attr);
                self.channel.trigger(
                    &format!("change:{attr}"),
                    &Event::ChangeAttr {
                        model: self.rc(),
                        attr: attr.clone(),
                        value,
                        options: options.clone(),
                    },
                );
            }
        }

        // A reentrant set stays inside the outer call's cycle; the
        // outermost call drains the aggregate notifications it queued.
        if was_changing {
            return Ok(());
        }
        if !options.silent {
            loop {
                let pending = self.state.borrow_mut().pending.take();
                let Some(pending_options) = pending else { break };
                self.channel.trigger(
                    "change",
                    &Event::Change {
                        model: self.rc(),
                        options: pending_options,
                    },
                );
            }
        }
        {
            let mut state = self.state.borrow_mut();
            state.pending = None;
            state.changing = false;
        }
        Ok(())
    }

    /// Runs the validator over current ∪ proposed. On rejection, records
    /// the error, fires `invalid`, and returns it.
    fn validate_proposed(
        &self,
        proposed: &[(String, Option<Value>)],
    ) -> Result<(), TetherError> {
        let failure = {
            let validator = self.validator.borrow();
            let Some(validator) = validator.as_ref() else {
                return Ok(());
            };
            let mut candidate = self.state.borrow().attributes.clone();
            for (attr, value) in proposed {
                match value {
                    Some(value) => {
                        candidate.insert(attr.clone(), value.clone());
                    }
                    None => {
                        candidate.remove(attr);
                    }
                }
            }
            validator(&candidate)
        };
        match failure {
            None => {
                self.state.borrow_mut().validation_error = None;
                Ok(())
            }
            Some(error) => {
                trace!("model {}: validation rejected", self.cid);
                self.state.borrow_mut().validation_error = Some(error.clone());
                self.channel.trigger(
                    "invalid",
                    &Event::Invalid {
                        error: error.clone(),
                    },
                );
                Err(TetherError::Validation(error))
            }
        }
    }

    // ---- change-cycle read accessors ----

    /// Whether anything (or `attr`, when given) has changed since the
    /// start of the current change cycle.
    #[must_use]
    pub fn has_changed(&self, attr: Option<&str>) -> bool {
        let state = self.state.borrow();
        match attr {
            None => !state.changed.is_empty(),
            Some(attr) => state.changed.contains_key(attr),
        }
    }

    /// With no argument, the net changes of the current cycle, or `None`
    /// when there are none. With `diff`, the subset of `diff` that would
    /// change the model relative to the cycle's base state.
    #[must_use]
    pub fn changed_attributes(
        &self,
        diff: Option<&Attributes>,
    ) -> Option<IndexMap<String, Option<Value>>> {
        let state = self.state.borrow();
        match diff {
            None => {
                if state.changed.is_empty() {
                    None
                } else {
                    Some(state.changed.clone())
                }
            }
            Some(diff) => {
                let base = if state.changing {
                    &state.previous
                } else {
                    &state.attributes
                };
                let mut changed = IndexMap::new();
                for (attr, value) in diff {
                    if base.get(attr) != Some(value) {
                        changed.insert(attr.clone(), Some(value.clone()));
                    }
                }
                if changed.is_empty() {
                    None
                } else {
                    Some(changed)
                }
            }
        }
    }

    /// The value `attr` held at the start of the current change cycle.
    #[must_use]
    pub fn previous(&self, attr: &str) -> Option<Value> {
        self.state.borrow().previous.get(attr).cloned()
    }

    #[must_use]
    pub fn previous_attributes(&self) -> Attributes {
        self.state.borrow().previous.clone()
    }

    /// The identity value held at the start of the current change cycle.
    #[must_use]
    pub fn previous_id(&self) -> Option<Value> {
        self.state
            .borrow()
            .previous
            .get(&self.id_attribute)
            .filter(|value| !value.is_null())
            .cloned()
    }

    // ---- transport orchestration ----

    /// The resource URL: the configured root (or the owning collection's
    /// URL) plus the id for persisted models.
    ///
    /// # Panics
    ///
    /// Panics when neither a URL root nor an owning collection URL is
    /// configured — a wiring defect, not a data condition.
    #[must_use]
    pub fn url(&self) -> String {
        let base = self
            .url_root
            .borrow()
            .clone()
            .or_else(|| self.collection().and_then(|collection| collection.url()))
            .unwrap_or_else(|| panic!("a url_root or an owning collection url must be specified"));
        match self.id() {
            Some(id) => format!("{}/{}", base.trim_end_matches('/'), id_key(&id)),
            None => base,
        }
    }

    /// Persists the model: `create` when new, otherwise `update` (or
    /// `patch`). Without `wait`, `attrs` are applied optimistically before
    /// the transport call; with `wait`, they are only validated now and
    /// applied when the transport succeeds. The transport's response is
    /// parsed and merged on success, followed by a `sync` event.
    pub fn save(&self, attrs: Option<Attributes>, options: &SaveOptions) -> Result<(), TetherError> {
        let set_options = SetOptions {
            unset: false,
            silent: options.silent,
            validate: options.validate,
        };
        if let Some(attrs) = &attrs {
            if options.wait {
                let proposed: Vec<(String, Option<Value>)> = attrs
                    .iter()
                    .map(|(attr, value)| (attr.clone(), Some(value.clone())))
                    .collect();
                if options.validate {
                    self.validate_proposed(&proposed)?;
                }
            } else {
                self.set_with(attrs.clone(), &set_options)?;
            }
        }

        let method = if self.is_new() {
            Method::Create
        } else if options.patch {
            Method::Patch
        } else {
            Method::Update
        };
        let body = if options.patch {
            Value::Object(attrs.clone().unwrap_or_default())
        } else {
            let mut merged = self.attributes();
            if options.wait {
                if let Some(attrs) = &attrs {
                    for (attr, value) in attrs {
                        merged.insert(attr.clone(), value.clone());
                    }
                }
            }
            Value::Object(merged)
        };

        let model = self.rc();
        let wait = options.wait;
        let wait_attrs = if wait { attrs } else { None };
        let success_options = set_options;
        let success = move |response: Value| {
            let mut server_attrs = model.parse_response(&response);
            if let Some(attrs) = wait_attrs {
                // The deferred attributes apply now, with the server's
                // word taking precedence.
                let mut merged = attrs;
                for (attr, value) in server_attrs {
                    merged.insert(attr, value);
                }
                server_attrs = merged;
            }
            let _ = model.set_with(server_attrs, &success_options);
            model
                .channel
                .trigger("sync", &Event::Sync { response });
        };
        let on_error = self.error_callback();
        self.dispatch_sync(method, Some(body), success, on_error);
        Ok(())
    }

    /// Reads the model's resource and sets the parsed response.
    pub fn fetch(&self, options: &SetOptions) {
        let model = self.rc();
        let set_options = options.clone();
        let success = move |response: Value| {
            let server_attrs = model.parse_response(&response);
            let _ = model.set_with(server_attrs, &set_options);
            model
                .channel
                .trigger("sync", &Event::Sync { response });
        };
        let on_error = self.error_callback();
        self.dispatch_sync(Method::Read, None, success, on_error);
    }

    /// Discards the model: fires `destroy` (detaching it from its
    /// collection via the collection's own subscription) and drops this
    /// model's delegated subscriptions. A persisted model also issues a
    /// `delete` through the transport; with `wait` the local destroy is
    /// deferred until that succeeds. A new model is destroyed locally
    /// only.
    pub fn destroy(&self, options: &DestroyOptions) {
        if self.is_new() {
            self.finish_destroy();
            return;
        }
        let wait = options.wait;
        let model = self.rc();
        let success = move |response: Value| {
            if wait {
                model.finish_destroy();
            }
            model
                .channel
                .trigger("sync", &Event::Sync { response });
        };
        let on_error = self.error_callback();
        self.dispatch_sync(Method::Delete, None, success, on_error);
        if !wait {
            self.finish_destroy();
        }
    }

    fn finish_destroy(&self) {
        self.channel.stop_listening(None, None, None);
        let collection = self.collection();
        self.channel.trigger(
            "destroy",
            &Event::Destroy {
                model: self.rc(),
                collection,
            },
        );
    }

    fn error_callback(&self) -> impl FnOnce(Value) + 'static {
        let model = self.rc();
        move |response: Value| {
            model
                .channel
                .trigger("error", &Event::TransportError { response });
        }
    }

    /// # Panics
    ///
    /// Panics when no transport is configured.
    fn dispatch_sync(
        &self,
        method: Method,
        body: Option<Value>,
        success: impl FnOnce(Value) + 'static,
        error: impl FnOnce(Value) + 'static,
    ) {
        let transport = self
            .transport
            .borrow()
            .clone()
            .unwrap_or_else(|| panic!("a transport must be configured to sync"));
        let url = self.url();
        trace!("model {}: {} {url}", self.cid, method.as_str());
        self.channel.trigger("request", &Event::Request { method });
        transport.sync(method, SyncRequest { url, body }, Completion::new(success, error));
    }

    fn parse_response(&self, response: &Value) -> Attributes {
        match self.parse.borrow().as_ref() {
            Some(parse) => parse(response),
            None => response.as_object().cloned().unwrap_or_default(),
        }
    }

    fn rc(&self) -> Rc<Model> {
        self.self_ref.upgrade().expect("model used after drop")
    }
}
