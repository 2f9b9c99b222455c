//! Server-side authentication policies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use qibus_net::random_u64;
use qibus_proto::capability::{KEY_TOKEN, KEY_USER};
use qibus_proto::{AuthState, CapabilityMap};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of checking one authenticate request.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// State to answer with.
    pub state: AuthState,
    /// Replacement token, sent under `auth_newToken` with
    /// [`AuthState::Continue`].
    pub new_token: Option<String>,
}

impl AuthOutcome {
    /// Plain success.
    pub fn done() -> Self {
        Self { state: AuthState::Done, new_token: None }
    }

    /// Plain refusal.
    pub fn refused() -> Self {
        Self { state: AuthState::Error, new_token: None }
    }

    /// Token-renewal round.
    pub fn renew(token: impl Into<String>) -> Self {
        Self { state: AuthState::Continue, new_token: Some(token.into()) }
    }
}

/// Decides whether a connection's credentials are acceptable.
pub trait Authenticator: Send + Sync {
    /// Check one authenticate request.
    fn authenticate(&self, request: &CapabilityMap) -> AuthOutcome;
}

/// Accepts everyone. The default for buses without credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveAuthenticator;

impl Authenticator for PermissiveAuthenticator {
    fn authenticate(&self, _request: &CapabilityMap) -> AuthOutcome {
        AuthOutcome::done()
    }
}

/// A user/token table.
///
/// Users provisioned with an empty token are issued a random one on first
/// contact via the `Continue` state; the client is expected to
/// re-authenticate with it (and persist it).
#[derive(Debug, Default)]
pub struct UserTokenAuthenticator {
    users: Mutex<HashMap<String, String>>,
}

impl UserTokenAuthenticator {
    /// Build from a user → token table.
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users: Mutex::new(users) }
    }

    /// The token currently associated with a user.
    pub fn token_of(&self, user: &str) -> Option<String> {
        lock(&self.users).get(user).cloned()
    }
}

impl Authenticator for UserTokenAuthenticator {
    fn authenticate(&self, request: &CapabilityMap) -> AuthOutcome {
        let Some(user) = request.get_str(KEY_USER) else {
            return AuthOutcome::refused();
        };
        let presented = request.get_str(KEY_TOKEN).unwrap_or_default();

        let mut users = lock(&self.users);
        match users.get(&user) {
            None => AuthOutcome::refused(),
            Some(stored) if stored.is_empty() => {
                let token = format!("{:016x}", random_u64());
                users.insert(user, token.clone());
                AuthOutcome::renew(token)
            },
            Some(stored) if *stored == presented => AuthOutcome::done(),
            Some(_) => AuthOutcome::refused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str, token: &str) -> CapabilityMap {
        CapabilityMap::preferred(user, token)
    }

    #[test]
    fn permissive_accepts_anonymous() {
        let outcome = PermissiveAuthenticator.authenticate(&request("", ""));
        assert_eq!(outcome.state, AuthState::Done);
    }

    #[test]
    fn matching_token_accepted() {
        let auth =
            UserTokenAuthenticator::new(HashMap::from([("nao".to_string(), "t".to_string())]));
        assert_eq!(auth.authenticate(&request("nao", "t")).state, AuthState::Done);
        assert_eq!(auth.authenticate(&request("nao", "wrong")).state, AuthState::Error);
        assert_eq!(auth.authenticate(&request("pepper", "t")).state, AuthState::Error);
    }

    #[test]
    fn empty_provisioned_token_triggers_renewal() {
        let auth =
            UserTokenAuthenticator::new(HashMap::from([("nao".to_string(), String::new())]));

        let outcome = auth.authenticate(&request("nao", ""));
        assert_eq!(outcome.state, AuthState::Continue);
        let issued = outcome.new_token.unwrap();

        // The issued token now authenticates.
        assert_eq!(auth.authenticate(&request("nao", &issued)).state, AuthState::Done);
    }
}
