//! Shell scripts run inside a guest.
//!
//! The SSH helper and the Docker backend both reach the guest through a
//! `sh -c` style remote command; the scripts they send are built here so both
//! transports behave identically. Every path is relative to `$HOME` and
//! embedded single-quoted.

use std::collections::BTreeMap;
use std::path::Path;

use ws_core::validation::{shell_quote, validate_guest_path};
use ws_core::Result;

use crate::RepositorySpec;

/// Guest file holding the git credential helper installed for token clones.
pub const CREDENTIAL_HELPER_PATH: &str = ".git-credential-ws";

/// Render `key: value` lines for the guest service config file.
pub fn config_blob(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{}: {}\n", key, value))
        .collect()
}

fn home_path(path: &str) -> String {
    format!("\"$HOME\"/{}", shell_quote(path))
}

/// Script that writes stdin to `path`, creating parent directories.
pub fn write_file_script(path: &str) -> Result<String> {
    validate_guest_path(path)?;
    let target = home_path(path);
    let script = match Path::new(path).parent().and_then(|p| p.to_str()) {
        Some(parent) if !parent.is_empty() => {
            format!("mkdir -p {} && cat > {}", home_path(parent), target)
        }
        _ => format!("cat > {}", target),
    };
    Ok(script)
}

pub fn read_file_script(path: &str) -> Result<String> {
    validate_guest_path(path)?;
    Ok(format!("cat -- {}", home_path(path)))
}

/// Credential helper answering git's prompt with `token`.
pub fn credential_helper(token: &str) -> String {
    format!(
        "#!/bin/sh\necho username=x-access-token\necho password={}\n",
        shell_quote(token)
    )
}

/// Script that installs the helper (fed on stdin) and points git at it.
pub fn install_credential_helper_script() -> String {
    let helper = home_path(CREDENTIAL_HELPER_PATH);
    format!(
        "cat > {helper} && chmod 700 {helper} && git config --global credential.helper \"$HOME/{name}\"",
        helper = helper,
        name = CREDENTIAL_HELPER_PATH
    )
}

/// Script that deletes the helper and unsets git's reference to it.
pub fn remove_credential_helper_script() -> String {
    format!(
        "rm -f {}; git config --global --unset credential.helper; true",
        home_path(CREDENTIAL_HELPER_PATH)
    )
}

/// Shallow single-branch clone into the home directory.
pub fn clone_script(repo: &RepositorySpec) -> Result<String> {
    let mut script = String::from("cd \"$HOME\" && git clone --depth 1 --single-branch");
    if let Some(branch) = &repo.branch {
        script.push_str(" --branch ");
        script.push_str(&shell_quote(branch));
    }
    script.push_str(" -- ");
    script.push_str(&shell_quote(&repo.url));
    if let Some(directory) = &repo.directory {
        validate_guest_path(directory)?;
        script.push(' ');
        script.push_str(&shell_quote(directory));
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_blob_is_sorted_key_value_lines() {
        let mut env = BTreeMap::new();
        env.insert("bind-addr".to_string(), "0.0.0.0:8080".to_string());
        env.insert("auth".to_string(), "none".to_string());
        assert_eq!(config_blob(&env), "auth: none\nbind-addr: 0.0.0.0:8080\n");
    }

    #[test]
    fn test_write_script_creates_parent() {
        let script = write_file_script("src/app/main.rs").unwrap();
        assert_eq!(
            script,
            "mkdir -p \"$HOME\"/'src/app' && cat > \"$HOME\"/'src/app/main.rs'"
        );
        assert_eq!(
            write_file_script("notes.txt").unwrap(),
            "cat > \"$HOME\"/'notes.txt'"
        );
    }

    #[test]
    fn test_scripts_quote_hostile_paths() {
        let script = read_file_script("it's; rm -rf ~").unwrap();
        assert_eq!(script, "cat -- \"$HOME\"/'it'\\''s; rm -rf ~'");
        assert!(read_file_script("../etc/passwd").is_err());
        assert!(write_file_script("/etc/passwd").is_err());
    }

    #[test]
    fn test_clone_script_with_branch_and_directory() {
        let repo = RepositorySpec {
            url: "https://github.com/acme/app.git".into(),
            branch: Some("main".into()),
            directory: Some("app".into()),
        };
        assert_eq!(
            clone_script(&repo).unwrap(),
            "cd \"$HOME\" && git clone --depth 1 --single-branch --branch 'main' -- 'https://github.com/acme/app.git' 'app'"
        );
    }

    #[test]
    fn test_credential_helper_embeds_token() {
        let helper = credential_helper("ghp_abc");
        assert!(helper.starts_with("#!/bin/sh\n"));
        assert!(helper.contains("password='ghp_abc'"));
        assert!(install_credential_helper_script().contains("credential.helper"));
    }

    #[test]
    fn test_remove_credential_helper_never_fails() {
        let script = remove_credential_helper_script();
        assert!(script.starts_with("rm -f \"$HOME\"/'.git-credential-ws';"));
        assert!(script.contains("--unset credential.helper"));
        assert!(script.ends_with("; true"));
    }
}
