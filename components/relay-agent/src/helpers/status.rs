// External crates
use std::fmt::Display;

/// User facing status lines, written to stderr so stdout stays untouched.
///
/// Warnings are always shown, informational lines only when not quiet.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusReporter {
    quiet: bool,
}

impl StatusReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Reporter that prints nothing but warnings.
    pub fn quiet() -> Self {
        Self { quiet: true }
    }

    pub fn info(&self, message: impl Display) {
        if !self.quiet {
            eprintln!("[relay] {message}");
        }
    }

    pub fn warn(&self, message: impl Display) {
        eprintln!("[relay] warning: {message}");
    }
}
