//! Path and diagnostics helpers.

/// Maximum number of characters kept from stdout/stderr in logs and errors.
pub const DIAGNOSTIC_PREFIX_CHARS: usize = 100;

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use slurmflow::ssh::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Keeps the first [`DIAGNOSTIC_PREFIX_CHARS`] characters of `text`,
/// trimmed of surrounding whitespace.
///
/// # Examples
///
/// ```
/// # use slurmflow::ssh::truncate_for_diagnostics;
/// assert_eq!(truncate_for_diagnostics("  boom \n"), "boom");
/// assert_eq!(truncate_for_diagnostics(&"x".repeat(300)).len(), 100);
/// ```
#[must_use]
pub fn truncate_for_diagnostics(text: &str) -> String {
    text.trim().chars().take(DIAGNOSTIC_PREFIX_CHARS).collect()
}
