//! Observability for rescuedb
//!
//! Structured JSON logging of lifecycle events. Logging is read-only with
//! respect to recovery: a failed write to stdout/stderr never changes the
//! outcome of a repair pass.
//!
//! # Usage
//!
//! ```ignore
//! use rescuedb::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::PageDamaged, &[("page", "12"), ("reason", "bad type")]);
//! ```

mod events;
mod logger;

pub use events::Event;
pub use logger::{Logger, Severity};

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_does_not_panic() {
        log_event(Event::RepairOpen);
        log_event_with_fields(Event::PageDamaged, &[("page", "3")]);
    }
}
