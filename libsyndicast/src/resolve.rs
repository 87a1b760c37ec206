//! Effective caption/media resolution and app-credential selection
//!
//! Pure functions over loaded rows so the precedence rules stay unit
//! testable without a database. Precedence everywhere is: account-scoped
//! override, then platform-scoped override, then the post default.

use crate::types::{AppCredentials, PlatformConfig, PostMedia, SocialAccount};

/// Resolve the caption actually sent for one account.
pub fn effective_caption(
    account: &SocialAccount,
    configs: &[PlatformConfig],
    post_caption: &str,
) -> String {
    if let Some(caption) = account_config(account, configs).and_then(|c| c.caption.clone()) {
        return caption;
    }
    if let Some(caption) = platform_config(account, configs).and_then(|c| c.caption.clone()) {
        return caption;
    }
    post_caption.to_string()
}

/// Resolve the platform-specific settings bag for one account.
pub fn effective_settings(
    account: &SocialAccount,
    configs: &[PlatformConfig],
) -> Option<serde_json::Value> {
    account_config(account, configs)
        .and_then(|c| c.settings.clone())
        .or_else(|| platform_config(account, configs).and_then(|c| c.settings.clone()))
}

/// Resolve the media set actually sent for one account.
///
/// Account-scoped rows win outright when any exist; otherwise
/// platform-scoped rows; otherwise the unscoped default set. Order within
/// a tier is preserved.
pub fn effective_media(account: &SocialAccount, media: &[PostMedia]) -> Vec<PostMedia> {
    let account_scoped: Vec<PostMedia> = media
        .iter()
        .filter(|m| m.account_scope.as_deref() == Some(account.id.as_str()))
        .cloned()
        .collect();
    if !account_scoped.is_empty() {
        return account_scoped;
    }

    let platform_scoped: Vec<PostMedia> = media
        .iter()
        .filter(|m| {
            m.account_scope.is_none()
                && m.platform_scope.as_deref() == Some(account.platform.as_str())
        })
        .cloned()
        .collect();
    if !platform_scoped.is_empty() {
        return platform_scoped;
    }

    media.iter().filter(|m| m.is_global()).cloned().collect()
}

/// Select the app credential row for one account.
///
/// An account that records a connection sub-type only accepts an exact
/// sub-type match; accounts without one use the generic (null sub-type)
/// credential set. Platforms with a single login flow store one generic
/// row and always take the second branch.
pub fn select_app_credentials(
    account: &SocialAccount,
    credentials: &[AppCredentials],
) -> Option<AppCredentials> {
    match account.connection_kind.as_deref() {
        Some(kind) => credentials
            .iter()
            .find(|c| c.sub_type.as_deref() == Some(kind))
            .cloned(),
        None => credentials.iter().find(|c| c.sub_type.is_none()).cloned(),
    }
}

fn account_config<'a>(
    account: &SocialAccount,
    configs: &'a [PlatformConfig],
) -> Option<&'a PlatformConfig> {
    configs
        .iter()
        .find(|c| c.account_id.as_deref() == Some(account.id.as_str()))
}

fn platform_config<'a>(
    account: &SocialAccount,
    configs: &'a [PlatformConfig],
) -> Option<&'a PlatformConfig> {
    configs
        .iter()
        .find(|c| c.account_id.is_none() && c.platform == account.platform)
}
