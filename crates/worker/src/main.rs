//! Standalone scheduling worker.
//!
//! Runs the engine's executor, sweep and housekeeping against in-memory
//! adapters, logging reminders instead of sending them. Reads commands from
//! stdin: `status` prints the engine status as JSON, `sweep` runs a sweep
//! immediately, `quit` (or EOF) shuts down.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;

use lessonflow_core::SystemClock;
use lessonflow_infra::TracingDispatcher;
use lessonflow_scheduling::{SchedulingConfig, SchedulingEngine};

const STATUS_UPCOMING: usize = 20;

fn main() -> anyhow::Result<()> {
    let config = SchedulingConfig::load().context("loading scheduling config")?;
    lessonflow_observability::init(config.logging.format);

    let engine = SchedulingEngine::in_memory(config, Arc::new(TracingDispatcher), SystemClock::shared());
    let handle = engine.start().context("starting scheduling engine")?;

    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        match line.trim() {
            "" => {}
            "status" => {
                let status = engine.status(STATUS_UPCOMING)?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            "sweep" => {
                let report = engine.run_sweep();
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            "quit" | "exit" => break,
            other => tracing::warn!(command = other, "unknown command"),
        }
    }

    handle.shutdown();
    Ok(())
}
