//! API key resolution.
//!
//! Keys are looked up in priority order: an explicit key from the request
//! or config, then a stored credential (via a pluggable
//! [`CredentialStore`]), then an environment variable.

use tracing::debug;

/// Source of previously saved credentials (e.g. an OS keychain adapter).
pub trait CredentialStore: Send + Sync {
    /// Return the stored key for a provider, if any.
    fn get(&self, provider: &str) -> Option<String>;
}

/// A store with nothing in it.
pub struct NoStoredCredentials;

impl CredentialStore for NoStoredCredentials {
    fn get(&self, _provider: &str) -> Option<String> {
        None
    }
}

/// Inputs to [`resolve_api_key`].
#[derive(Debug, Clone)]
pub struct KeyRequest<'a> {
    pub provider: &'a str,
    pub explicit_key: Option<&'a str>,
    pub use_stored_credentials: bool,
    pub use_environment_vars: bool,
}

/// Environment variables consulted for a provider, in order.
pub fn env_vars_for(provider: &str) -> &'static [&'static str] {
    match provider {
        "azure" => &["AZURE_OPENAI_API_KEY", "OPENAI_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        _ => &[],
    }
}

/// Resolve an API key: explicit > stored > environment.
pub fn resolve_api_key(request: &KeyRequest<'_>, store: &dyn CredentialStore) -> Option<String> {
    resolve_with_env(request, store, |name| std::env::var(name).ok())
}

fn resolve_with_env(
    request: &KeyRequest<'_>,
    store: &dyn CredentialStore,
    env: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };

    if let Some(key) = request.explicit_key.map(str::to_string).and_then(non_empty) {
        debug!(provider = request.provider, "using explicit api key");
        return Some(key);
    }

    if request.use_stored_credentials {
        if let Some(key) = store.get(request.provider).and_then(non_empty) {
            debug!(provider = request.provider, "using stored api key");
            return Some(key);
        }
    }

    if request.use_environment_vars {
        for name in env_vars_for(request.provider) {
            if let Some(key) = env(name).and_then(non_empty) {
                debug!(provider = request.provider, var = name, "using api key from environment");
                return Some(key);
            }
        }
    }

    None
}
