use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Serialize, Serializer};
use serde_json::Value;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ControlKey(Arc<str>);

impl ControlKey {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ControlKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ControlKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ControlKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl Serialize for ControlKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

// Allocated from one monotonic counter per store, so a later-started run
// always carries a larger token.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct RunToken(pub u64);

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ControlValidation {
    pub results: BTreeMap<String, Option<bool>>,
    pub valid: bool,
    pub dirty: bool,
    pub touched: bool,
    pub pending: BTreeSet<RunToken>,
    #[serde(skip)]
    pub(crate) last_committed: Option<RunToken>,
}

impl ControlValidation {
    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FormState {
    pub values: BTreeMap<ControlKey, Value>,
    pub validation: BTreeMap<ControlKey, ControlValidation>,
    pub dirty: bool,
    pub touched: bool,
    pub valid: bool,
    pub pending: bool,
}

impl FormState {
    pub fn value(&self, name: &ControlKey) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn control(&self, name: &ControlKey) -> Option<&ControlValidation> {
        self.validation.get(name)
    }

    // Every key in `validation` must have a key in `values`.
    pub(crate) fn ensure_control(&mut self, name: &ControlKey) -> &mut ControlValidation {
        self.values.entry(name.clone()).or_insert(Value::Null);
        self.validation.entry(name.clone()).or_default()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FormError {
    StatePoisoned(&'static str),
    EmptyControlName,
    ValidityCheckPanicked { control: ControlKey },
}

impl Display for FormError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::StatePoisoned(context) => {
                write!(f, "form state lock poisoned while {context}")
            }
            FormError::EmptyControlName => f.write_str("control name must be non-empty"),
            FormError::ValidityCheckPanicked { control } => {
                write!(f, "validity check for control '{control}' panicked")
            }
        }
    }
}

impl std::error::Error for FormError {}

pub type FormResult<T> = Result<T, FormError>;

// Batches fold left to right under the write lock; no intermediate state is
// observable.
pub(crate) type Mutation = Box<dyn FnOnce(FormState) -> FormState + Send>;

pub(crate) mod mutations {
    use super::{ControlKey, ControlValidation, Mutation, RunToken, Value};

    pub(crate) fn update_value(name: ControlKey, value: Value) -> Mutation {
        Box::new(move |mut state| {
            state.ensure_control(&name);
            state.values.insert(name, value);
            state
        })
    }

    pub(crate) fn mark_dirty(name: ControlKey) -> Mutation {
        Box::new(move |mut state| {
            state.ensure_control(&name).dirty = true;
            state
        })
    }

    pub(crate) fn mark_touched(name: ControlKey) -> Mutation {
        Box::new(move |mut state| {
            state.ensure_control(&name).touched = true;
            state
        })
    }

    pub(crate) fn seed_control(
        name: ControlKey,
        value: Value,
        validator_names: Vec<String>,
        watermark: RunToken,
    ) -> Mutation {
        Box::new(move |mut state| {
            state.values.insert(name.clone(), value);
            // Runs started under the previous binding carry smaller tokens
            // than the watermark and are discarded on commit.
            let seeded = ControlValidation {
                results: validator_names
                    .into_iter()
                    .map(|validator| (validator, None))
                    .collect(),
                last_committed: Some(watermark),
                ..ControlValidation::default()
            };
            state.validation.insert(name, seeded);
            state
        })
    }

    pub(crate) fn push_pending(name: ControlKey, token: RunToken) -> Mutation {
        Box::new(move |mut state| {
            state.ensure_control(&name).pending.insert(token);
            state
        })
    }

    pub(crate) fn touch_all() -> Mutation {
        Box::new(|mut state| {
            for control in state.validation.values_mut() {
                control.dirty = true;
                control.touched = true;
            }
            state
        })
    }

    pub(crate) fn rename_control(old: ControlKey, new: ControlKey) -> Mutation {
        Box::new(move |mut state| {
            if let Some(value) = state.values.remove(&old) {
                state.values.insert(new.clone(), value);
            }
            if let Some(mut validation) = state.validation.remove(&old) {
                // In-flight runs commit under the old name and are discarded
                // there, so their tokens would never drain from this set.
                validation.pending.clear();
                state.validation.insert(new, validation);
            }
            state
        })
    }

    pub(crate) fn remove_control(name: ControlKey) -> Mutation {
        Box::new(move |mut state| {
            state.values.remove(&name);
            state.validation.remove(&name);
            state
        })
    }
}

pub(crate) fn fold_global(state: &mut FormState) {
    let mut dirty = false;
    let mut touched = false;
    let mut valid = true;
    let mut pending = false;
    for control in state.validation.values() {
        dirty |= control.dirty;
        touched |= control.touched;
        valid &= control.valid;
        pending |= control.is_pending();
    }
    state.dirty = dirty;
    state.touched = touched;
    state.valid = valid;
    state.pending = pending;
}

pub(crate) struct ControlCommit {
    pub(crate) name: ControlKey,
    pub(crate) results: BTreeMap<String, bool>,
    pub(crate) valid: bool,
}

type SubscriberFn = Arc<dyn Fn(&FormState) + Send + Sync>;
type SubscriberMap = BTreeMap<u64, SubscriberFn>;

pub struct Subscription {
    id: u64,
    subscribers: Weak<RwLock<SubscriberMap>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade()
            && let Ok(mut subscribers) = subscribers.write()
        {
            subscribers.remove(&self.id);
        }
    }
}

#[derive(Clone)]
pub(crate) struct StateStore {
    state: Arc<RwLock<FormState>>,
    run_tokens: Arc<AtomicU64>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    subscriber_ids: Arc<AtomicU64>,
}

impl StateStore {
    pub(crate) fn new() -> Self {
        let mut initial = FormState::default();
        fold_global(&mut initial);
        Self {
            state: Arc::new(RwLock::new(initial)),
            run_tokens: Arc::new(AtomicU64::new(1)),
            subscribers: Arc::new(RwLock::new(BTreeMap::new())),
            subscriber_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn next_run_token(&self) -> RunToken {
        RunToken(self.run_tokens.fetch_add(1, Ordering::SeqCst))
    }

    // The next token to be allocated; every already-started run is below it.
    pub(crate) fn token_watermark(&self) -> RunToken {
        RunToken(self.run_tokens.load(Ordering::SeqCst))
    }

    pub(crate) fn snapshot(&self) -> FormResult<FormState> {
        Ok(read_lock(&self.state, "reading form snapshot")?.clone())
    }

    pub(crate) fn apply(&self, batch: Vec<Mutation>) -> FormResult<()> {
        let snapshot = {
            let mut state = write_lock(&self.state, "applying mutation batch")?;
            let folded = batch
                .into_iter()
                .fold(std::mem::take(&mut *state), |next, mutation| mutation(next));
            *state = folded;
            fold_global(&mut *state);
            state.clone()
        };
        self.notify(&snapshot);
        Ok(())
    }

    pub(crate) fn commit_run_results(
        &self,
        token: RunToken,
        commits: Vec<ControlCommit>,
    ) -> FormResult<()> {
        let snapshot = {
            let mut state = write_lock(&self.state, "committing validation results")?;
            for commit in commits {
                // Membership was guaranteed at dispatch time, so an absent
                // key means the control was unbound or renamed mid-flight;
                // committing would resurrect it.
                let Some(control) = state.validation.get_mut(&commit.name) else {
                    log::debug!(
                        "discarding validation run {:?} for removed control '{}'",
                        token,
                        commit.name
                    );
                    continue;
                };
                control.pending.remove(&token);
                if control.last_committed.is_some_and(|last| token < last) {
                    log::debug!(
                        "discarding superseded validation run {:?} for control '{}'",
                        token,
                        commit.name
                    );
                    continue;
                }
                for (validator, result) in commit.results {
                    control.results.insert(validator, Some(result));
                }
                control.valid = commit.valid;
                control.last_committed = Some(token);
            }
            fold_global(&mut *state);
            state.clone()
        };
        self.notify(&snapshot);
        Ok(())
    }

    pub(crate) fn subscribe(
        &self,
        callback: impl Fn(&FormState) + Send + Sync + 'static,
    ) -> FormResult<Subscription> {
        let id = self.subscriber_ids.fetch_add(1, Ordering::SeqCst);
        write_lock(&self.subscribers, "registering subscriber")?.insert(id, Arc::new(callback));
        Ok(Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        })
    }

    fn notify(&self, snapshot: &FormState) {
        let subscribers = match self.subscribers.read() {
            Ok(subscribers) => subscribers.values().cloned().collect::<Vec<_>>(),
            Err(_) => return,
        };
        for subscriber in subscribers {
            subscriber(snapshot);
        }
    }
}

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
