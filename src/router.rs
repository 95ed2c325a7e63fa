//! A minimal URL-fragment router.
//!
//! Route patterns support `:param` (one path segment), `*splat` (the rest
//! of the fragment), and `(optional)` groups, and compile to anchored
//! regexes. Navigation is driven entirely by explicit [`Router::navigate`]
//! calls: the first route registered that matches wins, its callback runs
//! with the decoded parameters, and `route:<name>` and `route` events fire
//! on the router's channel.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;
use regex::{Captures, Regex};

use crate::events::{Callback, Event, EventChannel};

/// A route callback, invoked with the decoded parameters.
pub type RouteHandler = Rc<dyn Fn(&[String])>;

struct Route {
    pattern: Regex,
    name: String,
    handler: RouteHandler,
}

/// Matches URL fragments against registered route patterns and publishes
/// the outcome through its event channel.
#[derive(Default)]
pub struct Router {
    channel: EventChannel,
    routes: RefCell<Vec<Route>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Router {
        Router {
            channel: EventChannel::new(),
            routes: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    pub fn on(&self, names: &str, callback: Callback) {
        self.channel.on(names, callback);
    }

    /// Registers a route. Routes match in registration order.
    ///
    /// # Panics
    ///
    /// Panics when the pattern does not compile — a wiring defect.
    pub fn route(&self, pattern: &str, name: &str, handler: impl Fn(&[String]) + 'static) {
        let compiled = route_to_regex(pattern);
        trace!("router: {name} <- {pattern} ({compiled})");
        self.routes.borrow_mut().push(Route {
            pattern: compiled,
            name: name.to_string(),
            handler: Rc::new(handler),
        });
    }

    /// Matches `fragment` against the registered routes. Returns whether a
    /// route matched.
    pub fn navigate(&self, fragment: &str) -> bool {
        let fragment = fragment.trim_start_matches('#').trim_start_matches('/');
        let matched = {
            let routes = self.routes.borrow();
            routes.iter().find_map(|route| {
                route.pattern.captures(fragment).map(|captures| {
                    (
                        route.name.clone(),
                        route.handler.clone(),
                        extract_parameters(&captures),
                    )
                })
            })
        };
        let Some((name, handler, params)) = matched else {
            return false;
        };
        handler(&params);
        let event = Event::Route {
            name: name.clone(),
            params,
        };
        self.channel.trigger(&format!("route:{name}"), &event);
        self.channel.trigger("route", &event);
        true
    }
}

/// Compiles a route pattern into an anchored regex: literals escaped,
/// `(…)` optional, `:param` one segment, `*splat` the rest, with a
/// trailing query group.
fn route_to_regex(pattern: &str) -> Regex {
    let escape = Regex::new(r"[-{}\[\]+?.,\\^$|#\s]").unwrap();
    let optional = Regex::new(r"\((.*?)\)").unwrap();
    let named = Regex::new(r"(\(\?)?:\w+").unwrap();
    let splat = Regex::new(r"\*\w+").unwrap();

    let escaped = escape.replace_all(pattern, r"\$0");
    let with_optional = optional.replace_all(&escaped, "(?:${1})?");
    let with_named = named.replace_all(&with_optional, |captures: &Captures| {
        if captures.get(1).is_some() {
            captures[0].to_string()
        } else {
            "([^/?]+)".to_string()
        }
    });
    let with_splat = splat.replace_all(&with_named, "([^?]*?)");
    Regex::new(&format!(r"^{with_splat}(?:\?([\s\S]*))?$"))
        .unwrap_or_else(|error| panic!("invalid route pattern {pattern:?}: {error}"))
}

/// The matched groups, percent-decoded, without the trailing query group.
fn extract_parameters(captures: &Captures) -> Vec<String> {
    let group_count = captures.len();
    (1..group_count.saturating_sub(1))
        .filter_map(|index| captures.get(index))
        .map(|group| percent_decode(group.as_str()))
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let high = (bytes[index + 1] as char).to_digit(16);
            let low = (bytes[index + 2] as char).to_digit(16);
            if let (Some(high), Some(low)) = (high, low) {
                decoded.push((high * 16 + low) as u8);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
