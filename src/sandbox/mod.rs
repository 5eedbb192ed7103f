//! Sandbox lifecycle.
//!
//! [`SandboxProvider`] is the contract any isolation backend implements.
//! [`SandboxSession`] is what a request holds: it tracks the handle, makes
//! every wait cancellable and destroys the sandbox at most once.
//! [`LocalSandboxProvider`] is the reference backend.

mod local;
mod provider;
mod session;

pub use local::LocalSandboxProvider;
pub use provider::{
    SandboxCommand, SandboxHandle, SandboxOutput, SandboxProvider, SandboxSpec, SandboxStatus,
};
pub use session::{CommandOutput, DestroyOutcome, SandboxSession};

/// Quotes `value` for safe interpolation into a `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_are_left_alone() {
        assert_eq!(shell_quote("src/lib.rs"), "src/lib.rs");
        assert_eq!(shell_quote("tb/1a2b-fix"), "tb/1a2b-fix");
    }

    #[test]
    fn special_characters_are_quoted() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }
}
