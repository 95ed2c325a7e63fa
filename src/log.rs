//! The `log` module defines an interface to the crate's internal logging
//! facilities: subscription bookkeeping, index moves, and transport
//! dispatch all emit trace-level messages through the standard `log`
//! facade.
//!
//! This module (re)exports the five logging macros: `error!`, `warn!`,
//! `info!`, `debug!` and `trace!`, where `error!` represents the
//! highest-priority log messages and `trace!` the lowest. To emit a log
//! message, simply use one of these macros in your code:
//!
//! ```rust
//! use tether::info;
//!
//! pub fn do_a_thing() {
//!     info!("A thing is being done.");
//! }
//! ```
//!
//! Logging is _disabled_ by default. Log messages are enabled/disabled
//! using the functions:
//!
//!  - `enable_logging()`: turns on all log messages
//!  - `disable_logging()`: turns off all log messages
//!  - `set_log_level(level: LevelFilter)`: enables only log messages with
//!    priority at least `level`
//!
//! In addition, per-module filtering of messages can be configured using
//! `set_module_filter()` / `set_module_filters()` and
//! `remove_module_filter()`. The global logger is installed on the first
//! configuration call; because a process-global logger can only be
//! installed once, module filters set after that first call take effect by
//! raising or lowering the global maximum only.

use env_logger::{Builder, WriteStyle};
pub use log::{debug, error, info, trace, warn, LevelFilter};

use std::collections::HashMap;
use std::sync::Mutex;

// Logging disabled.
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Off;
// Automatically determine if output supports color.
const DEFAULT_LOG_STYLE: WriteStyle = WriteStyle::Auto;

/// A global instance of the logging configuration.
static LOG_CONFIGURATION: Mutex<Option<LogConfiguration>> = Mutex::new(None);

/// Holds logging configuration so it persists across reconfiguration
/// calls.
struct LogConfiguration {
    /// The "default" level filter for modules ("targets") without an
    /// explicitly set filter. A global filter level of `LevelFilter::Off`
    /// disables logging.
    global_log_level: LevelFilter,
    /// Whether to colorize output.
    log_style: WriteStyle,
    /// Holds module ("target") specific level filters.
    module_level: HashMap<String, LevelFilter>,
    /// Whether the process-global logger has been installed.
    installed: bool,
}

impl Default for LogConfiguration {
    fn default() -> Self {
        LogConfiguration {
            global_log_level: DEFAULT_LOG_LEVEL,
            log_style: DEFAULT_LOG_STYLE,
            module_level: HashMap::new(),
            installed: false,
        }
    }
}

impl LogConfiguration {
    /// The most permissive level any filter asks for; the facade's global
    /// maximum must admit it.
    fn max_level(&self) -> LevelFilter {
        self.module_level
            .values()
            .copied()
            .chain([self.global_log_level])
            .max()
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Enables the logger with no global level filter / full logging.
/// Equivalent to `set_log_level(LevelFilter::Trace)`.
pub fn enable_logging() {
    set_log_level(LevelFilter::Trace);
}

/// Disables logging completely. Equivalent to
/// `set_log_level(LevelFilter::Off)`.
pub fn disable_logging() {
    set_log_level(LevelFilter::Off);
}

/// Sets the global log level. A global filter level of `LevelFilter::Off`
/// disables logging.
pub fn set_log_level(level: LevelFilter) {
    with_configuration(|configuration| {
        configuration.global_log_level = level;
    });
}

/// Sets a level filter for the given module path.
pub fn set_module_filter(module_path: &str, level_filter: LevelFilter) {
    with_configuration(|configuration| {
        configuration
            .module_level
            .insert(module_path.to_string(), level_filter);
    });
}

/// Removes a module-specific level filter for the given module path. The
/// global level filter will apply to the module.
pub fn remove_module_filter(module_path: &str) {
    with_configuration(|configuration| {
        configuration.module_level.remove(module_path);
    });
}

/// Sets the level filters for a set of modules according to the provided
/// map. Use this instead of `set_module_filter()` to set filters in bulk.
#[allow(clippy::implicit_hasher)]
pub fn set_module_filters(module_filters: &HashMap<&str, LevelFilter>) {
    with_configuration(|configuration| {
        configuration.module_level.extend(
            module_filters
                .iter()
                .map(|(module_path, level)| ((*module_path).to_string(), *level)),
        );
    });
}

/// Mutates the global configuration under its lock, then applies it.
fn with_configuration(mutate: impl FnOnce(&mut LogConfiguration)) {
    let mut guard = LOG_CONFIGURATION.lock().unwrap();
    let configuration = guard.get_or_insert_with(LogConfiguration::default);
    mutate(configuration);

    if !configuration.installed {
        let mut builder = Builder::new();
        builder
            .filter_level(configuration.global_log_level)
            .write_style(configuration.log_style);
        for (module, filter) in &configuration.module_level {
            builder.filter(Some(module), *filter);
        }
        // Another logger may already own the process; ours then stays a
        // configuration-only facade.
        if builder.try_init().is_ok() {
            configuration.installed = true;
        }
    }
    log::set_max_level(configuration.max_level());
}
