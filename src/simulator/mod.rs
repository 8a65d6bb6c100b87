//! Local execution simulator
//!
//! Drives a compiled program from `begin` to `end` the way the managed backend
//! would, but in-process:
//!
//! 1. Resolve the context's action to a step (or stop at `end`)
//! 2. `foreach` steps run as a fan-out batch, everything else runs once
//! 3. Merge the transition into the running context
//! 4. Pause if a wait was requested, then repeat
//!
//! Only one step or one fan-out batch is in flight at a time. A `wait N until`
//! condition that never holds keeps the run going forever; there is no
//! deadline.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

mod fan_out;


use crate::compiler::CompiledProgram;
use crate::config::SimulatorConfig;
use crate::errors::RunError;
use crate::types::{Action, Context, Transition};

/// One step invocation during a run
#[derive(Debug, Clone)]
pub struct StepVisit {
    pub step: String,
    pub started_at: DateTime<Utc>,
    /// Wait requested after this invocation, in seconds
    pub wait: u64,
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub result: JsonValue,
    pub visits: Vec<StepVisit>,
}

impl RunReport {
    /// Step names in invocation order
    pub fn path(&self) -> Vec<&str> {
        self.visits.iter().map(|visit| visit.step.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Simulator {
    config: SimulatorConfig,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Run to completion and return the terminal result
    pub async fn run(
        &self,
        program: &CompiledProgram,
        initial: JsonValue,
    ) -> Result<JsonValue, RunError> {
        Ok(self.run_traced(program, initial).await?.result)
    }

    /// Run to completion, keeping a record of every step invocation
    pub async fn run_traced(
        &self,
        program: &CompiledProgram,
        initial: JsonValue,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("simulation", %run_id, version = %program.version());

        self.drive(program, initial, run_id).instrument(span).await
    }

    async fn drive(
        &self,
        program: &CompiledProgram,
        initial: JsonValue,
        run_id: Uuid,
    ) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let mut ctx = Context::new(program.entry(), initial);
        let mut visits = Vec::new();

        tracing::info!("run started");

        loop {
            let id = match ctx.action {
                Action::End => break,
                Action::Step(id) => id,
            };
            let step = program
                .step(id)
                .ok_or_else(|| RunError::UnresolvedAction(id.to_string()))?;

            let started_at = Utc::now();
            tracing::debug!(step = %step.name, "invoking step");

            let transition = if step.is_loop() {
                fan_out::run_batch(program, step, &ctx, &self.config).await?
            } else {
                step.invoke(&ctx)?
            };

            if let Transition::Advance(advance) = &transition {
                tracing::debug!(
                    step = %step.name,
                    next = %program.action_name(advance.action),
                    "step finished"
                );
            }
            ctx.apply(transition);

            visits.push(StepVisit {
                step: step.name.clone(),
                started_at,
                wait: ctx.wait,
            });

            if ctx.wait > 0 {
                let pause = self.config.pause_for(ctx.wait);
                tracing::info!(
                    requested_seconds = ctx.wait,
                    pause_ms = pause.as_millis() as u64,
                    "pausing"
                );
                tokio::time::sleep(pause).await;
            }
        }

        tracing::info!(
            steps = visits.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run completed"
        );

        Ok(RunReport {
            run_id,
            result: ctx.result,
            visits,
        })
    }
}
