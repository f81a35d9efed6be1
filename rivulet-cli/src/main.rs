use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use rivulet_core::region::{
    FlowExecutionPlan, RegionDefFormer, RegionExecutionPlan, StaticRegionExecutionPlanFactory,
};
use rivulet_core::{Engine, EngineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser, Debug)]
#[command(name = "rivulet")]
#[command(about = "Runs the rivulet demo join flow", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prints the initial execution plan without running the flow.
    Plan {
        #[command(flatten)]
        layout: Layout,
    },
    /// Runs the flow, optionally reconfiguring it half way, then drains it.
    Run {
        #[command(flatten)]
        layout: Layout,
        /// JSON engine configuration; missing fields keep their defaults.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 1000)]
        duration_ms: u64,
        #[arg(long, value_enum, default_value_t = Action::None)]
        action: Action,
        /// Replica count of the join region after `--action rebalance`.
        #[arg(long)]
        rebalance_to: Option<usize>,
        #[arg(long, default_value_t = 30_000)]
        shutdown_timeout_ms: u64,
    },
}

#[derive(clap::Args, Debug)]
struct Layout {
    /// Replicas of every partitioned region.
    #[arg(long, default_value_t = 2)]
    replicas: usize,
    /// Start with the join region cut into two pipelines.
    #[arg(long)]
    split_pipelines: bool,
    #[arg(long, default_value_t = 64)]
    keys: i64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    None,
    Merge,
    Split,
    Rebalance,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan { layout } => {
            let join = demo::join_flow(layout.keys)?;
            let plans = region_plans(&join, &layout)?;
            let plan = FlowExecutionPlan::new(0, Arc::clone(&join.flow), plans);
            println!("{}", serde_json::to_string_pretty(&plan.summary())?);
        }
        Commands::Run {
            mut layout,
            config,
            duration_ms,
            action,
            rebalance_to,
            shutdown_timeout_ms,
        } => {
            let config = load_config(config.as_deref())?;
            // merging needs more than one pipeline to begin with
            layout.split_pipelines |= action == Action::Merge;
            let join = demo::join_flow(layout.keys)?;
            let plans = region_plans(&join, &layout)?;
            let engine = Engine::run(config, Arc::clone(&join.flow), plans)?;

            let half = Duration::from_millis(duration_ms / 2);
            thread::sleep(half);
            if action != Action::None {
                let target = rebalance_to.unwrap_or(layout.replicas * 2);
                let plan = reconfigure(&engine, action, target)?;
                info!(version = plan.version(), ?action, "reconfigured");
            }
            thread::sleep(half);

            let plan = engine.flow_execution_plan()?;
            println!("{}", serde_json::to_string_pretty(&plan.summary())?);
            engine.shutdown(Duration::from_millis(shutdown_timeout_ms))?;
            report(&join)?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn region_plans(join: &demo::JoinFlow, layout: &Layout) -> Result<Vec<RegionExecutionPlan>> {
    let regions = RegionDefFormer::new().create_regions(&join.flow)?;
    StaticRegionExecutionPlanFactory::new(layout.replicas)
        .with_pipeline_split(layout.split_pipelines)
        .create_region_execution_plans(regions)
}

fn reconfigure(engine: &Engine, action: Action, rebalance_to: usize) -> Result<FlowExecutionPlan> {
    let plan = engine.flow_execution_plan()?;
    let region = plan
        .region_of("joiner")
        .ok_or_else(|| anyhow!("the join region is missing from the plan"))?;
    let pipelines = region.pipeline_ids();
    let completion = match action {
        Action::None => return Ok(plan),
        Action::Merge => engine.merge_pipelines(plan.version(), pipelines),
        Action::Split => {
            let first = pipelines[0];
            let operators = region
                .operator_count_by_pipeline_start_index(first.pipeline_start_index)
                .unwrap_or(1);
            if operators < 2 {
                return Err(anyhow!("pipeline {} has a single operator and cannot be split", first));
            }
            engine.split_pipeline(plan.version(), first, vec![1])
        }
        Action::Rebalance => engine.rebalance_region(plan.version(), region.region_id(), rebalance_to),
    };
    Ok(completion.wait()?)
}

fn report(join: &demo::JoinFlow) -> Result<()> {
    let emitted = join.emitted.lock().map_err(|_| anyhow!("emitted totals poisoned"))?;
    let collected = join.collected.lock().map_err(|_| anyhow!("collected totals poisoned"))?;
    let mismatched: Vec<i64> = emitted
        .iter()
        .filter(|&(key, sum)| collected.get(key) != Some(&(sum * 100)))
        .map(|(key, _)| *key)
        .collect();
    println!(
        "keys={} emitted_total={} mismatched={:?}",
        emitted.len(),
        emitted.values().sum::<i64>(),
        mismatched
    );
    if mismatched.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} keys do not match their emitted sums", mismatched.len()))
    }
}
