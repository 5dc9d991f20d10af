//! Reporter trait for dependency injection
//!
//! Lets the installer report progress without being coupled to a terminal.

use std::path::Path;

use kiln_schema::ConcreteSpec;

/// Progress sink for installs, fetches and uninstalls.
pub trait Reporter: Send + Sync {
    /// A new section has started (e.g. "Installing").
    fn section(&self, title: &str);

    /// A node's source is being fetched from `source`.
    fn fetching(&self, spec: &ConcreteSpec, source: &str);

    /// A node entered a build phase.
    fn phase(&self, spec: &ConcreteSpec, phase: &str);

    /// A node was installed into `prefix`.
    fn installed(&self, spec: &ConcreteSpec, prefix: &Path);

    /// A node was already installed.
    fn already_installed(&self, spec: &ConcreteSpec, prefix: &Path);

    /// A node failed with `reason`.
    fn failed(&self, spec: &ConcreteSpec, reason: &str);

    /// A node is being removed.
    fn removing(&self, spec: &ConcreteSpec);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// Display a final summary of multiple operations.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn fetching(&self, spec: &ConcreteSpec, source: &str) {
        (**self).fetching(spec, source);
    }
    fn phase(&self, spec: &ConcreteSpec, phase: &str) {
        (**self).phase(spec, phase);
    }
    fn installed(&self, spec: &ConcreteSpec, prefix: &Path) {
        (**self).installed(spec, prefix);
    }
    fn already_installed(&self, spec: &ConcreteSpec, prefix: &Path) {
        (**self).already_installed(spec, prefix);
    }
    fn failed(&self, spec: &ConcreteSpec, reason: &str) {
        (**self).failed(spec, reason);
    }
    fn removing(&self, spec: &ConcreteSpec) {
        (**self).removing(spec);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn fetching(&self, _: &ConcreteSpec, _: &str) {}
    fn phase(&self, _: &ConcreteSpec, _: &str) {}
    fn installed(&self, _: &ConcreteSpec, _: &Path) {}
    fn already_installed(&self, _: &ConcreteSpec, _: &Path) {}
    fn failed(&self, _: &ConcreteSpec, _: &str) {}
    fn removing(&self, _: &ConcreteSpec) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn summary(&self, _: usize, _: &str, _: f64) {}
}
