//! Collaborator hooks invoked by the publisher and subscriber roles.
//!
//! Every hook is optional. When [`Hooks::authenticate`] is unset no
//! credentials are required; when [`Hooks::check_mount`] is unset every
//! DESCRIBE is allowed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::mount::Mount;
use crate::protocol::RtspRequest;

/// Verifies a Basic `(username, password)` pair.
pub type AuthenticateHook = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Decides whether a DESCRIBE for the requested mount may proceed.
pub type CheckMountHook = Arc<dyn Fn(&RtspRequest) -> bool + Send + Sync>;

/// Notification about a mount (fire-and-forget).
pub type MountHook = Arc<dyn Fn(&Mount) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub authenticate: Option<AuthenticateHook>,
    pub check_mount: Option<CheckMountHook>,
    /// Every stream of a mount just lost its last playing client.
    pub mount_now_empty: Option<MountHook>,
    /// A subscriber session on the mount was closed.
    pub client_close: Option<MountHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authenticate<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.authenticate = Some(Arc::new(f));
        self
    }

    /// Require Basic credentials matching a fixed `username -> password` table.
    pub fn with_credentials(self, users: HashMap<String, String>) -> Self {
        self.with_authenticate(move |user, pass| {
            users.get(user).is_some_and(|expected| expected == pass)
        })
    }

    pub fn with_check_mount<F>(mut self, f: F) -> Self
    where
        F: Fn(&RtspRequest) -> bool + Send + Sync + 'static,
    {
        self.check_mount = Some(Arc::new(f));
        self
    }

    pub fn with_mount_now_empty<F>(mut self, f: F) -> Self
    where
        F: Fn(&Mount) + Send + Sync + 'static,
    {
        self.mount_now_empty = Some(Arc::new(f));
        self
    }

    pub fn with_client_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Mount) + Send + Sync + 'static,
    {
        self.client_close = Some(Arc::new(f));
        self
    }

    pub(crate) fn mount_allowed(&self, request: &RtspRequest) -> bool {
        self.check_mount.as_ref().is_none_or(|check| check(request))
    }

    pub(crate) fn notify_mount_empty(&self, mount: &Mount) {
        if let Some(hook) = &self.mount_now_empty {
            hook(mount);
        }
    }

    pub(crate) fn notify_client_close(&self, mount: &Mount) {
        if let Some(hook) = &self.client_close {
            hook(mount);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("authenticate", &self.authenticate.is_some())
            .field("check_mount", &self.check_mount.is_some())
            .field("mount_now_empty", &self.mount_now_empty.is_some())
            .field("client_close", &self.client_close.is_some())
            .finish()
    }
}
