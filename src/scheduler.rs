use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use futures::future::{Either, join_all, select};
use futures_timer::Delay;
use serde_json::Value;

use crate::binding::{
    Binding, BoxedValidationFuture, PeerDependencies, PeerValues, ValidatorFailure,
    default_is_valid_check,
};
use crate::controller::FormController;
use crate::state::{ControlCommit, ControlKey, FormError, FormResult, mutations};

impl FormController {
    // Pending tokens are committed before any validator is polled, so
    // observers see the pending state first. The token's monotonic ordering
    // lets the store discard results superseded by a later-started run.
    pub(crate) async fn run_validation(&self, name: &ControlKey) -> FormResult<()> {
        let mut to_revalidate = vec![name.clone()];
        for dependant in self.registry.dependants_of(name)? {
            if !to_revalidate.contains(&dependant) {
                to_revalidate.push(dependant);
            }
        }

        let token = self.store.next_run_token();
        log::debug!(
            "validation run {:?} triggered by '{}' covers {} control(s)",
            token,
            name,
            to_revalidate.len()
        );
        self.store.apply(
            to_revalidate
                .iter()
                .map(|control| mutations::push_pending(control.clone(), token))
                .collect(),
        )?;

        // One values snapshot for the whole run; every member reads its peer
        // values from the same generation.
        let values = self.store.snapshot()?.values;
        let timeout = self.options.validator_timeout;

        let mut jobs = Vec::with_capacity(to_revalidate.len());
        for control in &to_revalidate {
            let plan = self.registry.validation_plan(control)?;
            let value = values.get(control).cloned().unwrap_or(Value::Null);
            let peer_values = gather_peer_values(&plan.peer_dependencies, &values);
            jobs.push(validate_single_control(
                control.clone(),
                value,
                peer_values,
                plan,
                timeout,
            ));
        }

        let resolved = join_all(jobs).await;
        let mut commits = Vec::with_capacity(resolved.len());
        for (commit, check_error) in resolved {
            if let Some(error) = check_error {
                self.emit_error(&error);
            }
            commits.push(commit);
        }
        self.store.commit_run_results(token, commits)
    }
}

fn gather_peer_values(
    peer_dependencies: &PeerDependencies,
    values: &BTreeMap<ControlKey, Value>,
) -> PeerValues {
    peer_dependencies
        .iter()
        .map(|(peer, exposed_key)| {
            let value = values.get(peer).cloned().unwrap_or(Value::Null);
            (exposed_key.clone(), value)
        })
        .collect()
}

// A failed validator counts as `false` and never aborts the others; a
// panicking custom check yields `valid = false` and is reported back.
async fn validate_single_control(
    name: ControlKey,
    value: Value,
    peer_values: PeerValues,
    plan: Binding,
    timeout: Option<Duration>,
) -> (ControlCommit, Option<FormError>) {
    let dispatched: Vec<_> = plan
        .validators
        .entries()
        .iter()
        .map(|(validator_name, validator)| {
            let outcome = validator(value.clone(), peer_values.clone());
            let validator_name = validator_name.clone();
            let control = name.clone();
            async move {
                let verdict = match timeout {
                    Some(window) => resolve_with_timeout(outcome, window).await,
                    None => outcome.await,
                };
                let result = match verdict {
                    Ok(result) => result,
                    Err(failure) => {
                        log::warn!(
                            "validator '{validator_name}' for control '{control}' failed: {failure}"
                        );
                        false
                    }
                };
                (validator_name, result)
            }
        })
        .collect();

    let results: BTreeMap<String, bool> = join_all(dispatched).await.into_iter().collect();

    let (valid, check_error) = match &plan.is_valid_check {
        Some(check) => match catch_unwind(AssertUnwindSafe(|| check(&results, &peer_values))) {
            Ok(valid) => (valid, None),
            Err(_) => (
                false,
                Some(FormError::ValidityCheckPanicked {
                    control: name.clone(),
                }),
            ),
        },
        None => (default_is_valid_check(&results, &peer_values), None),
    };

    (
        ControlCommit {
            name,
            results,
            valid,
        },
        check_error,
    )
}

async fn resolve_with_timeout(
    outcome: BoxedValidationFuture,
    window: Duration,
) -> Result<bool, ValidatorFailure> {
    match select(outcome, Delay::new(window)).await {
        Either::Left((verdict, _)) => verdict,
        Either::Right(((), _)) => Err(ValidatorFailure::from("timed out")),
    }
}
