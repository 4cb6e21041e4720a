//! Connection ↔ identity bookkeeping with exactly-once online/offline
//! transitions.
//!
//! An identity is online while at least one connection is bound to it.
//! Every mutation computes its transitions under the write lock, so two
//! connections of the same identity racing to connect or disconnect can
//! never both observe a 0↔1 edge. Hooks run after the lock is released.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};

use {tokio::sync::RwLock, tracing::debug};

use crate::{
    context::{Context, Identity},
    error::HandlerError,
    middleware::HookFuture,
};

/// An identity gained its first or lost its last connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Online(Identity),
    Offline(Identity),
}

struct Bound {
    identity: Identity,
    connections: HashSet<String>,
}

#[derive(Default)]
struct PresenceState {
    /// Every live connection and the identity id bound to it, if any.
    connections: HashMap<String, Option<String>>,
    identities: HashMap<String, Bound>,
}

impl PresenceState {
    fn unbind(&mut self, connection_id: &str, identity_id: &str) -> Option<Transition> {
        let bound = self.identities.get_mut(identity_id)?;
        bound.connections.remove(connection_id);
        if !bound.connections.is_empty() {
            return None;
        }
        self.identities
            .remove(identity_id)
            .map(|bound| Transition::Offline(bound.identity))
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    state: RwLock<PresenceState>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection. Returns `false` if it was already known.
    pub async fn connect(&self, connection_id: &str) -> bool {
        let mut state = self.state.write().await;
        if state.connections.contains_key(connection_id) {
            return false;
        }
        state.connections.insert(connection_id.to_string(), None);
        true
    }

    /// Bind `identity` to a live connection.
    ///
    /// Rebinding a connection to another identity moves it, which can take
    /// the previous identity offline. Connections that were never connected,
    /// or already disconnected, are left untouched and yield no transitions.
    pub async fn authenticate(&self, connection_id: &str, identity: Identity) -> Vec<Transition> {
        let mut state = self.state.write().await;
        let Some(slot) = state.connections.get_mut(connection_id) else {
            debug!(connection_id, "ignoring identity for unknown connection");
            return Vec::new();
        };
        let previous = slot.replace(identity.id.clone());

        let mut transitions = Vec::new();
        if let Some(previous) = previous {
            if previous == identity.id {
                return transitions;
            }
            transitions.extend(state.unbind(connection_id, &previous));
        }

        let bound = state
            .identities
            .entry(identity.id.clone())
            .or_insert_with(|| Bound {
                identity: identity.clone(),
                connections: HashSet::new(),
            });
        let first = bound.connections.is_empty();
        bound.connections.insert(connection_id.to_string());
        if first {
            transitions.push(Transition::Online(identity));
        }
        debug!(connection_id, transitions = transitions.len(), "connection authenticated");
        transitions
    }

    /// Forget a connection. Unknown connections are ignored, which makes a
    /// second disconnect of the same connection a no-op.
    pub async fn disconnect(&self, connection_id: &str) -> Option<Transition> {
        let mut state = self.state.write().await;
        let identity_id = state.connections.remove(connection_id)??;
        state.unbind(connection_id, &identity_id)
    }

    pub async fn connections_for(&self, identity_id: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .identities
            .get(identity_id)
            .map(|bound| bound.connections.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn identity_of(&self, connection_id: &str) -> Option<Identity> {
        let state = self.state.read().await;
        let identity_id = state.connections.get(connection_id)?.as_ref()?;
        state
            .identities
            .get(identity_id)
            .map(|bound| bound.identity.clone())
    }

    pub async fn is_connected(&self, connection_id: &str) -> bool {
        self.state
            .read()
            .await
            .connections
            .contains_key(connection_id)
    }

    pub async fn is_online(&self, identity_id: &str) -> bool {
        self.state.read().await.identities.contains_key(identity_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn online_count(&self) -> usize {
        self.state.read().await.identities.len()
    }
}

// ── Hooks ────────────────────────────────────────────────────────────────────

pub type PresenceHook = Arc<dyn Fn(Context, Identity) -> HookFuture<()> + Send + Sync>;

/// Application callbacks fired on presence transitions.
#[derive(Clone, Default)]
pub struct PresenceHooks {
    pub(crate) on_online: Option<PresenceHook>,
    pub(crate) on_offline: Option<PresenceHook>,
}

impl PresenceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_online<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Identity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_online = Some(Arc::new(move |ctx, identity| Box::pin(hook(ctx, identity))));
        self
    }

    pub fn on_offline<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Identity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_offline = Some(Arc::new(move |ctx, identity| Box::pin(hook(ctx, identity))));
        self
    }

    pub(crate) fn for_transition(&self, transition: &Transition) -> Option<&PresenceHook> {
        match transition {
            Transition::Online(_) => self.on_online.as_ref(),
            Transition::Offline(_) => self.on_offline.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, futures::future::join_all};

    fn alice() -> Identity {
        Identity::new("alice")
    }

    #[tokio::test]
    async fn online_on_first_offline_on_last() {
        let registry = PresenceRegistry::new();
        assert!(registry.connect("a").await);
        assert!(registry.connect("b").await);
        assert!(!registry.connect("a").await);

        assert_eq!(registry.authenticate("a", alice()).await, vec![
            Transition::Online(alice())
        ]);
        assert!(registry.authenticate("b", alice()).await.is_empty());
        assert!(registry.is_online("alice").await);

        let mut conns = registry.connections_for("alice").await;
        conns.sort();
        assert_eq!(conns, vec!["a", "b"]);

        assert_eq!(registry.disconnect("a").await, None);
        assert_eq!(
            registry.disconnect("b").await,
            Some(Transition::Offline(alice()))
        );
        assert_eq!(registry.disconnect("b").await, None);
        assert!(!registry.is_online("alice").await);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn reauthenticating_same_identity_is_a_no_op() {
        let registry = PresenceRegistry::new();
        registry.connect("a").await;
        registry.authenticate("a", alice()).await;
        assert!(registry.authenticate("a", alice()).await.is_empty());
        assert_eq!(registry.connections_for("alice").await, vec!["a"]);
    }

    #[tokio::test]
    async fn rebinding_moves_the_connection() {
        let registry = PresenceRegistry::new();
        registry.connect("a").await;
        registry.authenticate("a", alice()).await;
        let transitions = registry.authenticate("a", Identity::new("bob")).await;
        assert_eq!(transitions, vec![
            Transition::Offline(alice()),
            Transition::Online(Identity::new("bob")),
        ]);
        assert_eq!(registry.identity_of("a").await.unwrap().id, "bob");
        assert!(registry.connections_for("alice").await.is_empty());
    }

    #[tokio::test]
    async fn anonymous_connections_never_transition() {
        let registry = PresenceRegistry::new();
        registry.connect("a").await;
        assert_eq!(registry.disconnect("a").await, None);
        assert_eq!(registry.online_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_connections_are_not_resurrected() {
        let registry = PresenceRegistry::new();
        assert!(registry.authenticate("ghost", alice()).await.is_empty());
        assert!(!registry.is_connected("ghost").await);

        registry.connect("a").await;
        registry.disconnect("a").await;
        assert!(registry.authenticate("a", alice()).await.is_empty());
        assert!(!registry.is_connected("a").await);
        assert!(!registry.is_online("alice").await);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_edges_fire_once() {
        let registry = Arc::new(PresenceRegistry::new());
        let ids: Vec<String> = (0..64).map(|i| format!("conn-{i}")).collect();
        for id in &ids {
            registry.connect(id).await;
        }

        let online = join_all(ids.iter().cloned().map(|id| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.authenticate(&id, alice()).await })
        }))
        .await;
        let online: usize = online.into_iter().map(|r| r.unwrap().len()).sum();
        assert_eq!(online, 1);

        let offline = join_all(ids.iter().cloned().map(|id| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.disconnect(&id).await })
        }))
        .await;
        let offline = offline
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(Transition::Offline(_)))))
            .count();
        assert_eq!(offline, 1);
    }
}
