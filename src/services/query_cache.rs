//! Read-through cache of view models with optimistic mutations.
//!
//! Entries live under namespace keys such as `["project", id]`. A mutation
//! moves through `Idle -> Pending(snapshot) -> Settled(Committed | RolledBack)`:
//! the optimistic value is written when it starts, the snapshot is restored
//! if it fails, and every namespace it touches is dropped once it settles so
//! the next read fetches authoritative state.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Hierarchical cache key. A key covers every key it is a prefix of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn child(&self, part: impl Into<String>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }

    pub fn covers(&self, other: &QueryKey) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Where non-validation mutation failures are surfaced.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        warn!(message, "mutation failed");
    }
}

/// Classification the cache needs from a mutation error.
pub trait MutationFailure {
    /// Field-keyed failures belong to the submitting form, not to a
    /// notification.
    fn is_validation(&self) -> bool;
    fn user_message(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Committed,
    RolledBack,
}

pub enum MutationState<V> {
    Idle,
    Pending { snapshot: Option<V> },
    Settled(Settlement),
}

impl<V> MutationState<V> {
    fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending { .. } => "pending",
            Self::Settled(Settlement::Committed) => "committed",
            Self::Settled(Settlement::RolledBack) => "rolled-back",
        }
    }
}

type Apply<V> = Box<dyn FnOnce(&V) -> V + Send>;

/// Description of one mutation's cache effects.
pub struct Mutation<V> {
    name: &'static str,
    optimistic: Option<(QueryKey, Apply<V>)>,
    invalidates: Vec<QueryKey>,
}

impl<V> Mutation<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            optimistic: None,
            invalidates: Vec::new(),
        }
    }

    /// Rewrite the cached value at `key` before the mutation runs. Skipped
    /// when nothing is cached there.
    pub fn optimistic(mut self, key: QueryKey, apply: impl FnOnce(&V) -> V + Send + 'static) -> Self {
        self.optimistic = Some((key, Box::new(apply)));
        self
    }

    pub fn invalidates(mut self, namespace: QueryKey) -> Self {
        self.invalidates.push(namespace);
        self
    }
}

struct Entries<V> {
    values: HashMap<QueryKey, V>,
    /// Bumped by every invalidation. A fetch that started under an older
    /// epoch may have read pre-mutation state and is not stored.
    epoch: u64,
}

pub struct QueryCache<V> {
    entries: RwLock<Entries<V>>,
    notifier: Arc<dyn Notifier>,
}

impl<V: Clone + Send + Sync> QueryCache<V> {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            entries: RwLock::new(Entries {
                values: HashMap::new(),
                epoch: 0,
            }),
            notifier,
        }
    }

    pub async fn get(&self, key: &QueryKey) -> Option<V> {
        self.entries.read().await.values.get(key).cloned()
    }

    #[cfg(test)]
    pub async fn set(&self, key: QueryKey, value: V) {
        self.entries.write().await.values.insert(key, value);
    }

    #[cfg(test)]
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.values.len()
    }

    /// Drop every entry under `namespace`. Returns how many were removed.
    pub async fn invalidate(&self, namespace: &QueryKey) -> usize {
        let mut entries = self.entries.write().await;
        entries.epoch += 1;
        let before = entries.values.len();
        entries.values.retain(|key, _| !namespace.covers(key));
        before - entries.values.len()
    }

    /// Serve a cached entry, or run `fetch` and cache its result.
    pub async fn get_or_fetch<E, Fut>(&self, key: QueryKey, fetch: Fut) -> Result<V, E>
    where
        Fut: Future<Output = Result<V, E>>,
    {
        let started = {
            let entries = self.entries.read().await;
            if let Some(value) = entries.values.get(&key) {
                debug!(key = %key, "cache hit");
                return Ok(value.clone());
            }
            entries.epoch
        };

        let value = fetch.await?;

        let mut entries = self.entries.write().await;
        if entries.epoch == started {
            entries.values.insert(key, value.clone());
        } else {
            debug!(key = %key, "invalidated during fetch; not cached");
        }
        Ok(value)
    }

    /// Run `run` with the cache effects described by `mutation`.
    pub async fn mutate<T, E, Fut>(&self, mutation: Mutation<V>, run: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: MutationFailure,
    {
        let Mutation {
            name,
            optimistic,
            invalidates,
        } = mutation;

        let mut state: MutationState<V> = MutationState::Idle;
        let mut target = None;

        if let Some((key, apply)) = optimistic {
            let mut entries = self.entries.write().await;
            let snapshot = entries.values.get(&key).cloned();
            if let Some(current) = &snapshot {
                let guess = apply(current);
                entries.values.insert(key.clone(), guess);
                debug!(mutation = name, key = %key, "optimistic write");
            }
            state = MutationState::Pending { snapshot };
            target = Some(key);
        }

        let result = run.await;

        state = match (state, &result, target) {
            (MutationState::Pending { snapshot }, Err(_), Some(key)) => {
                self.restore(&key, snapshot).await;
                debug!(mutation = name, key = %key, "optimistic write rolled back");
                MutationState::Settled(Settlement::RolledBack)
            }
            (_, Err(_), _) => MutationState::Settled(Settlement::RolledBack),
            (_, Ok(_), _) => MutationState::Settled(Settlement::Committed),
        };

        for namespace in &invalidates {
            let hit = self.invalidate(namespace).await;
            debug!(mutation = name, namespace = %namespace, hit, "invalidated");
        }

        if let Err(err) = &result {
            if !err.is_validation() {
                self.notifier.notify(&err.user_message());
            }
        }
        debug!(mutation = name, state = state.label(), "mutation settled");
        result
    }

    /// Put the pre-mutation value back. With no snapshot nothing was
    /// written, so there is nothing to undo.
    async fn restore(&self, key: &QueryKey, snapshot: Option<V>) {
        if let Some(value) = snapshot {
            self.entries.write().await.values.insert(key.clone(), value);
        }
    }
}

impl<V> fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache").finish_non_exhaustive()
    }
}
