//! Session/mode gate: guest (local simulation) or user (backend), resolved once at startup,
//! and the per-send route derived from the mode and connectivity.

use crate::api::{SessionProbe, User};

/// Operating mode, fixed for the app session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// No authenticated session; every send is simulated locally.
    Guest,
    /// Authenticated; sends go to the backend.
    User(User),
}

impl Mode {
    /// Probe the session once. Any probe failure (network, 5xx, no session) falls back to guest.
    pub async fn resolve(probe: &dyn SessionProbe) -> Mode {
        match probe.current_user().await {
            Ok(Some(user)) => {
                log::info!("auth: session ok for {} ({})", user.id, user.email);
                Mode::User(user)
            }
            Ok(None) => {
                log::info!("auth: no session, running as guest");
                Mode::Guest
            }
            Err(e) => {
                log::warn!("auth: session probe failed, running as guest: {}", e);
                Mode::Guest
            }
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Mode::Guest)
    }
}

/// Path one send takes; selected once per send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    BackendOnline,
    BackendOffline,
}

impl Route {
    pub fn select(mode: &Mode, online: bool) -> Route {
        match (mode, online) {
            (Mode::Guest, _) => Route::Local,
            (Mode::User(_), true) => Route::BackendOnline,
            (Mode::User(_), false) => Route::BackendOffline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use async_trait::async_trait;

    struct FixedProbe(Result<Option<User>, u16>);

    #[async_trait]
    impl SessionProbe for FixedProbe {
        async fn current_user(&self) -> Result<Option<User>, ApiError> {
            match &self.0 {
                Ok(u) => Ok(u.clone()),
                Err(status) => Err(ApiError::Status {
                    status: *status,
                    detail: "down".to_string(),
                    request_id: None,
                }),
            }
        }
    }

    fn user() -> User {
        User {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            name: None,
            role: None,
        }
    }

    #[tokio::test]
    async fn resolve_maps_probe_outcomes() {
        assert_eq!(Mode::resolve(&FixedProbe(Ok(Some(user())))).await, Mode::User(user()));
        assert_eq!(Mode::resolve(&FixedProbe(Ok(None))).await, Mode::Guest);
        assert_eq!(Mode::resolve(&FixedProbe(Err(503))).await, Mode::Guest);
    }

    #[test]
    fn guest_is_always_local() {
        assert_eq!(Route::select(&Mode::Guest, true), Route::Local);
        assert_eq!(Route::select(&Mode::Guest, false), Route::Local);
        assert_eq!(Route::select(&Mode::User(user()), true), Route::BackendOnline);
        assert_eq!(Route::select(&Mode::User(user()), false), Route::BackendOffline);
    }
}
