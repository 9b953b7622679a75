//! Small helpers shared across modules.

use std::borrow::Cow;
use std::path::PathBuf;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/.vaws"` → `"/home/user/.vaws"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Per-user state directory (`~/.vaws`).
pub fn default_state_dir() -> PathBuf {
    PathBuf::from(expand_tilde("~/.vaws").into_owned())
}

/// Last path segment of an ARN or resource path.
///
/// `arn:aws:ecs:eu-west-1:123456789012:cluster/prod` → `prod`. Strings without
/// a `/` are returned as-is.
pub fn short_name(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}
