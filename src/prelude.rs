pub use crate::collection::{
    Changes, Collection, CollectionOptions, Comparator, CreateOptions, FetchOptions, Item, Lookup,
    Matcher, ModelFactory,
};
pub use crate::error::TetherError;
pub use crate::events::{callback, Callback, ChannelId, Event, EventChannel, ALL};
pub use crate::log::{debug, error, info, trace, warn};
pub use crate::model::{
    Attributes, Cid, DestroyOptions, Model, ModelOptions, SaveOptions, SetOptions, Validator,
};
pub use crate::router::Router;
pub use crate::sync::{Completion, Method, SyncRequest, Transport};
