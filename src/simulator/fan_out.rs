//! Fan-out batches
//!
//! Every iteration key gets its own worker with its own copy of the context.
//! Workers run on the blocking pool, at most `worker_pool_size` at a time, and
//! the batch is a barrier: nothing is merged until every worker has reported.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::compiler::{CompiledProgram, CompiledStep, StepFn};
use crate::config::SimulatorConfig;
use crate::errors::RunError;
use crate::types::{Action, Advance, Context, Transition};

/// Run `step` once per key in `ctx.iteration_keys` and join the results
///
/// Values come back in key order. All workers must agree on the next action;
/// the first error aborts the batch when `fail_fast` is set, otherwise the
/// error of the lowest key wins once every worker is done.
pub(crate) async fn run_batch(
    program: &CompiledProgram,
    step: &CompiledStep,
    ctx: &Context,
    config: &SimulatorConfig,
) -> Result<Transition, RunError> {
    let keys = ctx.iteration_keys.clone().ok_or_else(|| {
        RunError::protocol(&step.name, "fan-out step reached without iterationKeys")
    })?;

    if keys.is_empty() {
        let mut advance = Advance::new(step.next, ctx.result.clone());
        advance.iteration_values = Some(Vec::new());
        return Ok(Transition::Advance(advance));
    }

    tracing::debug!(step = %step.name, keys = keys.len(), "starting fan-out");

    let total = keys.len();
    let permits = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
    let mut workers = JoinSet::new();

    for (index, key) in keys.into_iter().enumerate() {
        let snapshot = ctx.for_key(key);
        let body = step.body();
        let permits = Arc::clone(&permits);
        let name = step.name.clone();

        workers.spawn(async move {
            let outcome = run_worker(snapshot, body, permits, name).await;
            (index, outcome)
        });
    }

    let mut values: Vec<Option<JsonValue>> = vec![None; total];
    let mut joint: Option<Action> = None;
    let mut failures: Vec<(usize, RunError)> = Vec::new();

    while let Some(joined) = workers.join_next().await {
        let (index, outcome) = match joined {
            Ok(joined) => joined,
            Err(err) => (
                usize::MAX,
                Err(RunError::WorkerPanicked {
                    step: step.name.clone(),
                    message: err.to_string(),
                }),
            ),
        };

        let (value, action) = match outcome {
            Ok(output) => output,
            Err(err) if config.fail_fast => {
                tracing::warn!(step = %step.name, error = %err, "fan-out worker failed, aborting batch");
                workers.abort_all();
                return Err(err);
            }
            Err(err) => {
                failures.push((index, err));
                continue;
            }
        };

        match joint {
            None => joint = Some(action),
            Some(first) if first != action => {
                workers.abort_all();
                return Err(RunError::FanOutDisagreement {
                    step: step.name.clone(),
                    first: program.action_name(first).to_string(),
                    other: program.action_name(action).to_string(),
                });
            }
            Some(_) => {}
        }

        if let Some(slot) = values.get_mut(index) {
            *slot = Some(value);
        }
    }

    failures.sort_by_key(|(index, _)| *index);
    if let Some((_, err)) = failures.into_iter().next() {
        return Err(err);
    }

    let values: Vec<JsonValue> = values.into_iter().flatten().collect();
    if values.len() != total {
        return Err(RunError::protocol(
            &step.name,
            "fan-out batch lost worker outputs",
        ));
    }

    let mut advance = Advance::new(joint.unwrap_or(step.next), ctx.result.clone());
    advance.iteration_values = Some(values);
    Ok(Transition::Advance(advance))
}

/// One isolated iteration: wait for a pool slot, then run the step body on
/// the blocking pool with this worker's own context
async fn run_worker(
    snapshot: Context,
    body: StepFn,
    permits: Arc<Semaphore>,
    name: String,
) -> Result<(JsonValue, Action), RunError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|err| RunError::WorkerPanicked {
            step: name.clone(),
            message: err.to_string(),
        })?;

    let transition = tokio::task::spawn_blocking(move || body(&snapshot))
        .await
        .map_err(|err| RunError::WorkerPanicked {
            step: name.clone(),
            message: err.to_string(),
        })??;

    match transition {
        Transition::Advance(Advance {
            action,
            iteration_value: Some(value),
            ..
        }) => Ok((value, action)),
        Transition::Advance(_) => Err(RunError::protocol(
            &name,
            "fan-out worker returned no iterationValue",
        )),
        Transition::Retry { .. } => Err(RunError::protocol(
            &name,
            "fan-out worker asked for a retry",
        )),
    }
}
