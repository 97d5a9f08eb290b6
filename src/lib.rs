//! Form-state management engine for component-based UIs.
//!
//! Tracks values, validation results, and dirty/touched status for a set of
//! named bindable controls. Validators (sync or async) may depend on peer
//! controls' values; a value change cascades revalidation through the
//! dependency graph, and per-control results fold into global form validity.
//!
//! The engine renders nothing and owns no widgets: a UI collaborator calls
//! [`FormController::bind`] once per mounted control, reports value/touch
//! events as they happen, and re-renders from the [`FormState`] snapshots it
//! receives through [`FormController::subscribe`].

mod binding;
mod controller;
mod scheduler;
mod state;


pub use binding::{
    BoxedValidationFuture, IsValidCheckFn, PeerDependencies, PeerValues, ValidatorFailure,
    Validators, default_is_valid_check,
};
pub use controller::{BindingUpdates, FormController, FormOptions};
pub use serde_json::Value;
pub use state::{
    ControlKey, ControlValidation, FormError, FormResult, FormState, RunToken, Subscription,
};
