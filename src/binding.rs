use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::state::{ControlKey, FormResult, read_lock, write_lock};

/// Peer values as seen by a validator, keyed by the name the declaring
/// control chose for each peer.
pub type PeerValues = BTreeMap<String, Value>;

/// Peer control name mapped to the key under which its current value is
/// exposed to the declaring control's validators.
pub type PeerDependencies = BTreeMap<ControlKey, String>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatorFailure(String);

impl ValidatorFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl Display for ValidatorFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ValidatorFailure {}

impl From<&str> for ValidatorFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ValidatorFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

pub type BoxedValidationFuture =
    Pin<Box<dyn Future<Output = Result<bool, ValidatorFailure>> + Send + 'static>>;

// Validators take their arguments by ownership so the returned future is
// `'static`.
pub(crate) type ValidatorFn =
    Arc<dyn Fn(Value, PeerValues) -> BoxedValidationFuture + Send + Sync>;

pub type IsValidCheckFn = Arc<dyn Fn(&BTreeMap<String, bool>, &PeerValues) -> bool + Send + Sync>;

/// Every resolved result must be true; an empty result map is valid.
pub fn default_is_valid_check(results: &BTreeMap<String, bool>, _peers: &PeerValues) -> bool {
    results.values().all(|result| *result)
}

/// Named validators for one control. Re-binding with a clone of the same
/// `Validators` value is detected as unchanged (per-name `Arc` identity).
#[derive(Clone, Default)]
pub struct Validators {
    entries: BTreeMap<String, ValidatorFn>,
}

impl Validators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        mut self,
        name: impl Into<String>,
        validator: impl Fn(&Value, &PeerValues) -> bool + Send + Sync + 'static,
    ) -> Self {
        let validator = Arc::new(validator);
        let wrapped: ValidatorFn = Arc::new(move |value: Value, peers: PeerValues| {
            let result = validator(&value, &peers);
            Box::pin(std::future::ready(Ok(result)))
        });
        self.entries.insert(name.into(), wrapped);
        self
    }

    pub fn fallible(
        mut self,
        name: impl Into<String>,
        validator: impl Fn(&Value, &PeerValues) -> Result<bool, ValidatorFailure>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        let validator = Arc::new(validator);
        let wrapped: ValidatorFn = Arc::new(move |value: Value, peers: PeerValues| {
            let result = validator(&value, &peers);
            Box::pin(std::future::ready(result))
        });
        self.entries.insert(name.into(), wrapped);
        self
    }

    pub fn future(
        mut self,
        name: impl Into<String>,
        validator: impl Fn(Value, PeerValues) -> BoxedValidationFuture + Send + Sync + 'static,
    ) -> Self {
        let wrapped: ValidatorFn = Arc::new(validator);
        self.entries.insert(name.into(), wrapped);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn entries(&self) -> &BTreeMap<String, ValidatorFn> {
        &self.entries
    }

    // Rust has no structural equality for closures; "same definition" means
    // the same key set with the same `Arc` behind every key.
    pub(crate) fn same_definition(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(name, validator)| {
                other
                    .entries
                    .get(name)
                    .is_some_and(|candidate| Arc::ptr_eq(validator, candidate))
            })
    }
}

impl std::fmt::Debug for Validators {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

#[derive(Clone, Default)]
pub(crate) struct Binding {
    pub(crate) validators: Validators,
    pub(crate) peer_dependencies: PeerDependencies,
    pub(crate) is_valid_check: Option<IsValidCheckFn>,
    pub(crate) dependant_of: BTreeSet<ControlKey>,
    // Stub bindings (bound = false) exist only to carry `dependant_of` edges
    // for controls named as a peer but never bound themselves.
    pub(crate) bound: bool,
}

pub(crate) struct RegisterOutcome {
    pub(crate) previously_bound: bool,
    pub(crate) definition_changed: bool,
}

#[derive(Clone)]
pub(crate) struct BindingRegistry {
    bindings: Arc<RwLock<BTreeMap<ControlKey, Binding>>>,
}

impl BindingRegistry {
    pub(crate) fn new() -> Self {
        Self {
            bindings: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub(crate) fn register(
        &self,
        name: &ControlKey,
        validators: Validators,
        peer_dependencies: PeerDependencies,
        is_valid_check: Option<IsValidCheckFn>,
    ) -> FormResult<RegisterOutcome> {
        let mut bindings = write_lock(&self.bindings, "registering control binding")?;

        let (previously_bound, definition_changed, old_peers) = match bindings.get(name) {
            Some(existing) if existing.bound => {
                let unchanged = existing.validators.same_definition(&validators)
                    && existing.peer_dependencies == peer_dependencies
                    && same_check(&existing.is_valid_check, &is_valid_check);
                (true, !unchanged, existing.peer_dependencies.clone())
            }
            _ => (false, true, PeerDependencies::new()),
        };

        if previously_bound && !definition_changed {
            return Ok(RegisterOutcome {
                previously_bound,
                definition_changed,
            });
        }

        // Reverse edges for peers the new definition no longer declares.
        for old_peer in old_peers.keys() {
            if !peer_dependencies.contains_key(old_peer)
                && let Some(peer) = bindings.get_mut(old_peer)
            {
                peer.dependant_of.remove(name);
            }
        }

        {
            let binding = bindings.entry(name.clone()).or_default();
            binding.bound = true;
            binding.validators = validators;
            binding.peer_dependencies = peer_dependencies.clone();
            binding.is_valid_check = is_valid_check;
        }

        for peer in peer_dependencies.keys() {
            bindings
                .entry(peer.clone())
                .or_default()
                .dependant_of
                .insert(name.clone());
        }

        Ok(RegisterOutcome {
            previously_bound,
            definition_changed,
        })
    }

    pub(crate) fn dependants_of(&self, name: &ControlKey) -> FormResult<BTreeSet<ControlKey>> {
        Ok(read_lock(&self.bindings, "reading dependants")?
            .get(name)
            .map(|binding| binding.dependant_of.clone())
            .unwrap_or_default())
    }

    pub(crate) fn validation_plan(&self, name: &ControlKey) -> FormResult<Binding> {
        Ok(read_lock(&self.bindings, "reading validation plan")?
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) fn rename(&self, old: &ControlKey, new: &ControlKey) -> FormResult<()> {
        let mut bindings = write_lock(&self.bindings, "renaming control binding")?;
        if let Some(binding) = bindings.remove(old) {
            bindings.insert(new.clone(), binding);
        }
        for binding in bindings.values_mut() {
            if binding.dependant_of.remove(old) {
                binding.dependant_of.insert(new.clone());
            }
            if let Some(exposed_key) = binding.peer_dependencies.remove(old) {
                binding.peer_dependencies.insert(new.clone(), exposed_key);
            }
        }
        Ok(())
    }

    // Peer-dependency declarations on `name` held by other controls are kept
    // (the control may bind again; its value reads null meanwhile), so the
    // binding is downgraded to a stub carrying those reverse edges.
    pub(crate) fn unbind(&self, name: &ControlKey) -> FormResult<()> {
        let mut bindings = write_lock(&self.bindings, "unbinding control")?;
        if let Some(removed) = bindings.remove(name)
            && !removed.dependant_of.is_empty()
        {
            bindings.insert(
                name.clone(),
                Binding {
                    dependant_of: removed.dependant_of,
                    ..Binding::default()
                },
            );
        }
        for binding in bindings.values_mut() {
            binding.dependant_of.remove(name);
        }
        Ok(())
    }
}

fn same_check(left: &Option<IsValidCheckFn>, right: &Option<IsValidCheckFn>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        _ => false,
    }
}
