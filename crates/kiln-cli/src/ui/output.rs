//! Console reporter.
//!
//! Progress lines go to stderr, one locked write per event. Tables and
//! command results go to stdout.

use std::io::Write;
use std::path::Path;

use crossterm::style::Stylize;
use kiln_core::Reporter;
use kiln_schema::ConcreteSpec;

use super::theme::{Theme, format_elapsed};

/// Terminal implementation of [`Reporter`].
#[derive(Debug)]
pub struct Console {
    theme: Theme,
    quiet: bool,
}

impl Console {
    pub fn new(quiet: bool) -> Self {
        Self {
            theme: Theme::default(),
            quiet,
        }
    }

    fn line(&self, text: &str) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{text}");
    }

    fn progress(&self, icon: &str, spec: &ConcreteSpec, status: &str) {
        if self.quiet {
            return;
        }
        let c = &self.theme.colors;
        let name = format!("{:<width$}", spec.short_form(), width = self.theme.spec_width);
        self.line(&format!("  {icon} {} {}", name.with(c.package_name), status.with(c.secondary)));
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Reporter for Console {
    fn section(&self, title: &str) {
        if !self.quiet {
            self.line(&format!("\n{}", title.bold()));
        }
    }

    fn fetching(&self, spec: &ConcreteSpec, source: &str) {
        self.progress(self.theme.icons.pending, spec, &format!("fetching {source}"));
    }

    fn phase(&self, spec: &ConcreteSpec, phase: &str) {
        self.progress(self.theme.icons.active, spec, phase);
    }

    fn installed(&self, spec: &ConcreteSpec, prefix: &Path) {
        let icon = self.theme.icons.success.with(self.theme.colors.success).to_string();
        self.progress(&icon, spec, &prefix.display().to_string());
    }

    fn already_installed(&self, spec: &ConcreteSpec, prefix: &Path) {
        let icon = self.theme.icons.success.with(self.theme.colors.success).to_string();
        self.progress(&icon, spec, &format!("already installed in {}", prefix.display()));
    }

    fn failed(&self, spec: &ConcreteSpec, reason: &str) {
        let c = &self.theme.colors;
        let name = format!("{:<width$}", spec.short_form(), width = self.theme.spec_width);
        self.line(&format!(
            "  {} {} {}",
            self.theme.icons.error.with(c.error),
            name.with(c.package_name),
            reason.with(c.error)
        ));
    }

    fn removing(&self, spec: &ConcreteSpec) {
        self.progress(self.theme.icons.active, spec, "removing");
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            self.line(&format!("  {} {msg}", self.theme.icons.info.with(self.theme.colors.secondary)));
        }
    }

    fn warning(&self, msg: &str) {
        let c = self.theme.colors.warning;
        self.line(&format!("  {} {}", self.theme.icons.warning.with(c), msg.with(c)));
    }

    fn error(&self, msg: &str) {
        let c = self.theme.colors.error;
        self.line(&format!("  {} {}", self.theme.icons.error.with(c), msg.with(c)));
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        if self.quiet {
            return;
        }
        let noun = if count == 1 { "spec" } else { "specs" };
        let msg = format!("{count} {noun} {action} in {}", format_elapsed(elapsed_secs));
        self.line(&format!("\n{}", msg.dark_grey()));
    }
}
