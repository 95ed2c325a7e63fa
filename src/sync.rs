//! The injected-transport boundary.
//!
//! The engine never talks to a network itself. Models and collections hand
//! a [`SyncRequest`] to whatever [`Transport`] was injected at construction
//! and interpret only the completion contract: the transport must
//! eventually invoke exactly one of [`Completion::success`] or
//! [`Completion::error`], on this thread, at a time of its choosing —
//! immediately within the `sync` call or arbitrarily later. Retry, timeout
//! and cancellation policy all belong to the transport.

use serde_json::Value;

/// The persistence operation a [`SyncRequest`] asks for, chosen by the
/// caller from the entity's state (`is_new`, patch flag).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Method {
    Create,
    Read,
    Update,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Read => "read",
            Method::Update => "update",
            Method::Patch => "patch",
            Method::Delete => "delete",
        }
    }
}

/// What the transport needs to perform one operation: the resource URL and,
/// for writing methods, the serialized entity body.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    pub url: String,
    pub body: Option<Value>,
}

/// The exactly-once completion pair for one [`SyncRequest`].
pub struct Completion {
    pub success: Box<dyn FnOnce(Value)>,
    pub error: Box<dyn FnOnce(Value)>,
}

impl Completion {
    pub fn new(
        success: impl FnOnce(Value) + 'static,
        error: impl FnOnce(Value) + 'static,
    ) -> Completion {
        Completion {
            success: Box::new(success),
            error: Box::new(error),
        }
    }

    /// Resolve the request successfully with the server's response.
    pub fn succeed(self, response: Value) {
        (self.success)(response);
    }

    /// Resolve the request as failed; the payload is opaque to the engine.
    pub fn fail(self, response: Value) {
        (self.error)(response);
    }
}

/// A pluggable persistence backend.
pub trait Transport {
    fn sync(&self, method: Method, request: SyncRequest, completion: Completion);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names() {
        assert_eq!(Method::Create.as_str(), "create");
        assert_eq!(Method::Delete.as_str(), "delete");
    }
}
