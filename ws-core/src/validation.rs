//! Validation of names and paths that end up in shell commands, device
//! names and proxy paths.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path};

use crate::error::{Error, Result};

static WORKSPACE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex is valid")
});

/// Workspace names double as hostnames, VM names and URL path segments.
pub fn validate_workspace_name(name: &str) -> Result<()> {
    if WORKSPACE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid workspace name '{}': use 1-63 lowercase letters, digits or '-', \
             starting and ending with a letter or digit",
            name
        )))
    }
}

/// Guest file paths are relative to the guest home directory and may not
/// climb out of it.
pub fn validate_guest_path(path: &str) -> Result<()> {
    if path.is_empty() || path.contains('\0') {
        return Err(Error::Validation("guest path must be a non-empty string".into()));
    }

    let parsed = Path::new(path);
    if parsed.is_absolute() {
        return Err(Error::Validation(format!(
            "guest path '{}' must be relative to the home directory",
            path
        )));
    }
    if parsed
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Validation(format!(
            "guest path '{}' must not contain '..'",
            path
        )));
    }

    Ok(())
}

/// Quote a value for safe embedding in a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_workspace_names() {
        for name in ["demo", "a", "my-box-1", "0abc"] {
            assert!(validate_workspace_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_workspace_names() {
        let too_long = "a".repeat(64);
        for name in ["", "-demo", "demo-", "Demo", "my_box", "a.b", too_long.as_str()] {
            assert!(validate_workspace_name(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn test_guest_path_rules() {
        assert!(validate_guest_path("project/README.md").is_ok());
        assert!(validate_guest_path(".bashrc").is_ok());
        assert!(validate_guest_path("/etc/passwd").is_err());
        assert!(validate_guest_path("../outside").is_err());
        assert!(validate_guest_path("a/../../b").is_err());
        assert!(validate_guest_path("").is_err());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
