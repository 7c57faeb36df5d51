//! OAuth token persistence (`~/.response-tracker/google/token.json`).
//!
//! The file is written atomically with owner-only permissions on unix.

use std::path::Path;

use super::{GoogleApiError, GoogleToken};

/// Load the stored Google OAuth token.
pub fn load_token() -> Result<GoogleToken, GoogleApiError> {
    load_token_at(&super::token_path())
}

/// Persist a Google OAuth token.
pub fn save_token(token: &GoogleToken) -> Result<(), GoogleApiError> {
    save_token_at(&super::token_path(), token)
}

/// Account email recorded in the token file, if any. Never errors.
pub fn peek_account_email() -> Option<String> {
    load_token()
        .ok()
        .and_then(|token| token.account)
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
}

fn load_token_at(path: &Path) -> Result<GoogleToken, GoogleApiError> {
    if !path.exists() {
        return Err(GoogleApiError::TokenNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| GoogleApiError::InvalidCredentials(format!("{}: {}", path.display(), e)))
}

fn save_token_at(path: &Path, token: &GoogleToken) -> Result<(), GoogleApiError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    let content = serde_json::to_string_pretty(token)?;
    crate::util::atomic_write_str(path, &content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
