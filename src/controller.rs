use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::binding::{BindingRegistry, IsValidCheckFn, PeerDependencies, Validators};
use crate::state::{
    ControlKey, FormError, FormResult, FormState, Mutation, StateStore, Subscription, mutations,
    read_lock, write_lock,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FormOptions {
    pub validator_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct BindingUpdates {
    pub name: Option<ControlKey>,
    pub value: Option<Value>,
}

type SubmitHandlerFn = Arc<dyn Fn(&FormState, &str) + Send + Sync>;
type ErrorHandlerFn = Arc<dyn Fn(&FormError) + Send + Sync>;

/// The engine facade a UI collaborator drives. Cheap to clone; clones share
/// the same store, registry, and handlers.
#[derive(Clone)]
pub struct FormController {
    pub(crate) options: FormOptions,
    pub(crate) store: StateStore,
    pub(crate) registry: BindingRegistry,
    submit_handler: Arc<RwLock<Option<SubmitHandlerFn>>>,
    error_handler: Arc<RwLock<Option<ErrorHandlerFn>>>,
}

impl Default for FormController {
    fn default() -> Self {
        Self::new(FormOptions::default())
    }
}

impl FormController {
    pub fn new(options: FormOptions) -> Self {
        Self {
            options,
            store: StateStore::new(),
            registry: BindingRegistry::new(),
            submit_handler: Arc::new(RwLock::new(None)),
            error_handler: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn bind(
        &self,
        name: impl Into<ControlKey>,
        initial_value: Value,
        validators: Validators,
        peer_dependencies: PeerDependencies,
        is_valid_check: Option<IsValidCheckFn>,
    ) -> FormResult<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(FormError::EmptyControlName);
        }

        let validator_names = validators.names();
        let outcome =
            self.registry
                .register(&name, validators, peer_dependencies, is_valid_check)?;

        if outcome.previously_bound {
            if !outcome.definition_changed {
                if self.store.snapshot()?.value(&name) == Some(&initial_value) {
                    log::trace!("re-bind of '{name}' is structurally identical; skipping");
                    return Ok(());
                }
                log::debug!("re-bind of '{name}' carries a new initial value");
            } else {
                log::warn!("control '{name}' bound more than once; last binding wins");
            }
        }

        self.store.apply(vec![mutations::seed_control(
            name.clone(),
            initial_value,
            validator_names,
            self.store.token_watermark(),
        )])?;
        self.run_validation(&name).await
    }

    pub async fn report_value_change(
        &self,
        name: impl Into<ControlKey>,
        value: Value,
    ) -> FormResult<()> {
        let name = name.into();
        let state = self.store.snapshot()?;
        let changed = state.value(&name) != Some(&value);
        if !changed && state.control(&name).is_some() {
            return Ok(());
        }

        let mut batch = vec![mutations::update_value(name.clone(), value)];
        if changed {
            batch.push(mutations::mark_dirty(name.clone()));
        }
        self.store.apply(batch)?;
        self.run_validation(&name).await
    }

    pub fn report_touch(&self, name: impl Into<ControlKey>) -> FormResult<()> {
        let name = name.into();
        if self
            .store
            .snapshot()?
            .control(&name)
            .is_some_and(|control| control.touched)
        {
            return Ok(());
        }
        self.store.apply(vec![mutations::mark_touched(name)])
    }

    pub async fn update_bindings(
        &self,
        old_name: impl Into<ControlKey>,
        updates: BindingUpdates,
    ) -> FormResult<()> {
        let old_name = old_name.into();
        let name = updates.name.unwrap_or_else(|| old_name.clone());
        if name.is_empty() {
            return Err(FormError::EmptyControlName);
        }

        let mut batch: Vec<Mutation> = Vec::new();
        if name != old_name {
            self.registry.rename(&old_name, &name)?;
            batch.push(mutations::rename_control(old_name.clone(), name.clone()));
        }
        if let Some(value) = updates.value {
            // Compare against the pre-batch key; the rename mutation runs first.
            let changed = self.store.snapshot()?.value(&old_name) != Some(&value);
            batch.push(mutations::update_value(name.clone(), value));
            if changed {
                batch.push(mutations::mark_dirty(name.clone()));
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        self.store.apply(batch)?;
        self.run_validation(&name).await
    }

    pub fn unbind(&self, name: impl Into<ControlKey>) -> FormResult<()> {
        let name = name.into();
        self.registry.unbind(&name)?;
        self.store.apply(vec![mutations::remove_control(name)])
    }

    /// Marks every control touched and dirty, then hands the settled snapshot
    /// to the registered submit handler along with `source`. Does not wait
    /// for in-flight validations.
    pub fn submit(&self, source: &str) -> FormResult<()> {
        self.store.apply(vec![mutations::touch_all()])?;
        let handler = read_lock(&self.submit_handler, "reading submit handler")?.clone();
        if let Some(handler) = handler {
            let state = self.store.snapshot()?;
            handler(&state, source);
        }
        Ok(())
    }

    pub fn set_submit_handler(
        &self,
        handler: impl Fn(&FormState, &str) + Send + Sync + 'static,
    ) -> FormResult<()> {
        *write_lock(&self.submit_handler, "setting submit handler")? = Some(Arc::new(handler));
        Ok(())
    }

    pub fn set_error_handler(
        &self,
        handler: impl Fn(&FormError) + Send + Sync + 'static,
    ) -> FormResult<()> {
        *write_lock(&self.error_handler, "setting error handler")? = Some(Arc::new(handler));
        Ok(())
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&FormState) + Send + Sync + 'static,
    ) -> FormResult<Subscription> {
        self.store.subscribe(callback)
    }

    pub fn state(&self) -> FormResult<FormState> {
        self.store.snapshot()
    }

    pub(crate) fn emit_error(&self, error: &FormError) {
        log::error!("{error}");
        let handler = self
            .error_handler
            .read()
            .ok()
            .and_then(|handler| handler.clone());
        if let Some(handler) = handler {
            handler(error);
        }
    }
}
