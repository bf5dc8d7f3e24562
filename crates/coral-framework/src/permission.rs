//! Permission boundary.
//!
//! The framework never decides who may do what. Command routing and the
//! plugin admin command ask a [`PermissionChecker`] supplied by the host and
//! treat its answer opaquely.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use coral_core::{GroupInfo, UserInfo};

/// Capability lookup consulted before privileged actions.
#[async_trait]
pub trait PermissionChecker: Send + Sync + 'static {
    /// Returns `true` if `actor` holds any of `names` within `scope`.
    async fn check_permission(
        &self,
        names: &[&str],
        actor: &UserInfo,
        scope: Option<&GroupInfo>,
    ) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check_permission(&self, _: &[&str], _: &UserInfo, _: Option<&GroupInfo>) -> bool {
        true
    }
}

/// Plain closures work as checkers.
#[async_trait]
impl<F> PermissionChecker for F
where
    F: Fn(&[&str], &UserInfo, Option<&GroupInfo>) -> bool + Send + Sync + 'static,
{
    async fn check_permission(
        &self,
        names: &[&str],
        actor: &UserInfo,
        scope: Option<&GroupInfo>,
    ) -> bool {
        self(names, actor, scope)
    }
}

/// In-memory grants keyed by user id, ignoring scope.
///
/// Useful for tests and single-operator deployments; real deployments plug in
/// their own store.
#[derive(Debug, Default)]
pub struct PermissionTable {
    grants: RwLock<HashMap<String, HashSet<String>>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: impl Into<String>, permission: impl Into<String>) {
        self.grants
            .write()
            .entry(user_id.into())
            .or_default()
            .insert(permission.into());
    }

    pub fn revoke(&self, user_id: &str, permission: &str) -> bool {
        self.grants
            .write()
            .get_mut(user_id)
            .is_some_and(|set| set.remove(permission))
    }
}

#[async_trait]
impl PermissionChecker for PermissionTable {
    async fn check_permission(
        &self,
        names: &[&str],
        actor: &UserInfo,
        _scope: Option<&GroupInfo>,
    ) -> bool {
        let grants = self.grants.read();
        grants.get(&actor.user_id).is_some_and(|held| {
            held.contains("*") || names.iter().any(|name| held.contains(*name))
        })
    }
}
