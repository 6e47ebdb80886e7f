//! Token resolution chain (§6): env > cached file > gh-CLI-style provider >
//! encrypted secret store > plaintext credentials file. The resolved token
//! is cached to a 0600 file so cron invocations (no keychain access) can
//! re-read it on every pulse.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no forge token available from any source")]
    NotFound,
    #[error("io error caching token at {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Env,
    CachedFile,
    GhCli,
    SecretStore,
    PlaintextCredentials,
}

/// Resolve a forge token, trying each source in priority order and caching
/// the winner to `cache_path` with `0600` permissions.
pub fn resolve_token(
    env_var: &str,
    cache_path: &Path,
    plaintext_credentials_path: &Path,
) -> Result<(String, TokenSource), TokenError> {
    if let Ok(token) = std::env::var(env_var) {
        if !token.is_empty() {
            cache_token(cache_path, &token)?;
            return Ok((token, TokenSource::Env));
        }
    }

    if let Ok(cached) = fs::read_to_string(cache_path) {
        let cached = cached.trim().to_string();
        if !cached.is_empty() {
            return Ok((cached, TokenSource::CachedFile));
        }
    }

    if let Some(token) = gh_cli_token() {
        cache_token(cache_path, &token)?;
        return Ok((token, TokenSource::GhCli));
    }

    if let Some(token) = secret_store_token() {
        cache_token(cache_path, &token)?;
        return Ok((token, TokenSource::SecretStore));
    }

    if let Ok(contents) = fs::read_to_string(plaintext_credentials_path) {
        let token = contents.trim().to_string();
        if !token.is_empty() {
            cache_token(cache_path, &token)?;
            return Ok((token, TokenSource::PlaintextCredentials));
        }
    }

    Err(TokenError::NotFound)
}

fn gh_cli_token() -> Option<String> {
    let output = Command::new("gh").args(["auth", "token"]).output().ok()?;
    if output.status.success() {
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() { None } else { Some(token) }
    } else {
        None
    }
}

/// Placeholder for a platform-specific encrypted secret store lookup (e.g.
/// macOS Keychain, libsecret). Interactive-only; unavailable from cron,
/// hence its low priority in the chain.
fn secret_store_token() -> Option<String> {
    None
}

fn cache_token(cache_path: &Path, token: &str) -> Result<(), TokenError> {
    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent).map_err(|source| TokenError::Cache {
            path: cache_path.to_path_buf(),
            source,
        })?;
    }
    fs::write(cache_path, token).map_err(|source| TokenError::Cache {
        path: cache_path.to_path_buf(),
        source,
    })?;
    set_owner_only_permissions(cache_path);
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_token_is_preferred_and_cached() {
        let td = tempdir().unwrap();
        let cache_path = td.path().join("token");
        let creds_path = td.path().join("creds");
        unsafe {
            std::env::set_var("FOREMAN_TEST_TOKEN", "env-token");
        }
        let (token, source) =
            resolve_token("FOREMAN_TEST_TOKEN", &cache_path, &creds_path).unwrap();
        assert_eq!(token, "env-token");
        assert_eq!(source, TokenSource::Env);
        assert_eq!(fs::read_to_string(&cache_path).unwrap(), "env-token");
        unsafe {
            std::env::remove_var("FOREMAN_TEST_TOKEN");
        }
    }

    #[test]
    fn falls_back_to_cached_file_when_env_unset() {
        let td = tempdir().unwrap();
        let cache_path = td.path().join("token");
        fs::write(&cache_path, "cached-token").unwrap();
        let creds_path = td.path().join("creds");
        let (token, source) =
            resolve_token("FOREMAN_TEST_TOKEN_UNSET", &cache_path, &creds_path).unwrap();
        assert_eq!(token, "cached-token");
        assert_eq!(source, TokenSource::CachedFile);
    }

    #[test]
    fn returns_not_found_when_nothing_resolves() {
        let td = tempdir().unwrap();
        let cache_path = td.path().join("token");
        let creds_path = td.path().join("creds");
        let result = resolve_token("FOREMAN_TEST_TOKEN_NOPE", &cache_path, &creds_path);
        assert!(matches!(result, Err(TokenError::NotFound)));
    }
}
