use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use sweep_core::{
    atomic_write_json_pretty, choose_predictions, chosen_digest, ensure_dir, write_submission,
    InstanceFilter, ReportStats,
};
use sweep_runner::{
    describe_sweep, ensure_dataset, load_config, run_sweep, show_problems, SweepOutcome,
    SweepSummary,
};

#[derive(Parser)]
#[command(name = "sweep", version = "0.1.0", about = "Benchmark sweep harness for code-editing agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved sweep configuration without running anything.
    Describe {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run the sweep. Positional directories are prior runs in descending
    /// priority; instances already plausible there are skipped.
    Run {
        #[arg(long)]
        config: PathBuf,
        prior_dirs: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List instance ids with the first line of each problem statement.
    Problems {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Merge run directories (descending priority) into one prediction per
    /// instance, writing the submission and stats under --out.
    Merge {
        dirs: Vec<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        copy_transcripts: bool,
        #[arg(long)]
        only: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Merge run directories in memory and print the stats, writing nothing.
    Report {
        dirs: Vec<PathBuf>,
        #[arg(long)]
        only: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write a sweep.yaml template into the current directory.
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { config, json } => {
            let cfg = load_config(&config)?;
            let summary = describe_sweep(&cfg)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Run {
            config,
            prior_dirs,
            json,
        } => {
            let cfg = load_config(&config)?;
            let summary = describe_sweep(&cfg)?;
            let outcome = run_sweep(&cfg, &prior_dirs)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&summary),
                    "outcome": outcome_to_json(&outcome),
                    "prior_dirs": prior_dirs
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>(),
                })));
            }
            print_summary(&summary);
            print_outcome(&outcome);
        }
        Commands::Problems { config, json } => {
            let cfg = load_config(&config)?;
            let dataset = ensure_dataset(&cfg)?;
            let problems = show_problems(&dataset);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "problems",
                    "count": problems.len(),
                    "problems": problems
                        .iter()
                        .map(|(inst, headline)| json!({
                            "instance_id": inst,
                            "headline": headline
                        }))
                        .collect::<Vec<_>>(),
                })));
            }
            for (inst, headline) in problems {
                println!("{}: {}", inst, headline);
            }
        }
        Commands::Merge {
            dirs,
            out,
            copy_transcripts,
            only,
            json,
        } => {
            let filter = only.as_deref().map(InstanceFilter::from_file).transpose()?;
            let label = out_label(&out);
            let transcripts_to = copy_transcripts.then_some(out.as_path());
            let chosen = choose_predictions(&dirs, &label, transcripts_to, filter.as_ref())?;
            ensure_dir(&out)?;
            let submission = write_submission(&out, &chosen)?;
            let stats = ReportStats::from_predictions(&chosen);
            atomic_write_json_pretty(&out.join("results.json"), &stats.to_json())?;
            let digest = chosen_digest(&chosen)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "merge",
                    "chosen": chosen.len(),
                    "out": out.display().to_string(),
                    "submission": submission.display().to_string(),
                    "digest": digest,
                    "stats": stats.to_json(),
                })));
            }
            println!("chosen: {}", chosen.len());
            println!("out: {}", out.display());
            println!("submission: {}", submission.display());
            println!("digest: {}", digest);
            print_stats(&stats);
        }
        Commands::Report { dirs, only, json } => {
            let filter = only.as_deref().map(InstanceFilter::from_file).transpose()?;
            let chosen = choose_predictions(&dirs, "report", None, filter.as_ref())?;
            let stats = ReportStats::from_predictions(&chosen);
            let digest = chosen_digest(&chosen)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "report",
                    "chosen": chosen.len(),
                    "digest": digest,
                    "stats": stats.to_json(),
                })));
            }
            println!("chosen: {}", chosen.len());
            println!("digest: {}", digest);
            print_stats(&stats);
        }
        Commands::Init { force } => {
            let path = std::env::current_dir()?.join("sweep.yaml");
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "config already exists (use --force): {}",
                    path.display()
                )));
            }

            let template = "\
version: '1'
sweep:
  prefix: ''                    # REQUIRED: label in front of the output dir name
  models: []                    # REQUIRED: agent backends, tried in order
  num_tries: 1                  # attempts per model before giving up
  temperature: 0.0
  threads: 1                    # how many instances to attempt concurrently
dataset:
  path: ''                      # REQUIRED: local JSON cache of the benchmark
  # source_url: ''              # fetched into `path` when the cache is missing
agent:
  command: []                   # REQUIRED: e.g. [python, ./agent.py]
testbed:
  namespace: aorwall
  timeout_seconds: 900
paths:
  predictions: predictions
  repos: repos
";
            std::fs::write(&path, template)?;
            println!("wrote: {}", path.display());
            println!("next: edit sweep.yaml \u{2014} fill in all fields marked REQUIRED");
            println!("next: sweep describe --config sweep.yaml");
        }
    }
    Ok(None)
}

fn out_label(out: &Path) -> String {
    out.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| out.display().to_string())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Run { json, .. }
        | Commands::Problems { json, .. }
        | Commands::Merge { json, .. }
        | Commands::Report { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn summary_to_json(summary: &SweepSummary) -> Value {
    json!({
        "prefix": summary.prefix,
        "models": summary.models,
        "num_tries": summary.num_tries,
        "temperature": summary.temperature,
        "threads": summary.threads,
        "dataset": summary.dataset_path.display().to_string(),
        "tasks": summary.task_count,
        "out_dir": summary.out_dir.display().to_string(),
        "model_name_or_path": summary.model_name_or_path,
        "agent_command": summary.agent_command,
        "testbed_namespace": summary.testbed_namespace,
        "timeout_seconds": summary.timeout_seconds,
    })
}

fn outcome_to_json(outcome: &SweepOutcome) -> Value {
    json!({
        "out_dir": outcome.out_dir.display().to_string(),
        "model_name_or_path": outcome.model_name_or_path,
        "attempted": outcome.attempted,
        "succeeded": outcome.succeeded,
        "exhausted": outcome.exhausted,
        "no_candidates": outcome.no_candidates,
        "failed": outcome.failed,
        "skipped_done": outcome.skipped_done,
        "skipped_plausible": outcome.skipped_plausible,
    })
}

fn print_summary(summary: &SweepSummary) {
    println!("prefix: {}", summary.prefix);
    println!("models: {:?}", summary.models);
    println!("num_tries: {}", summary.num_tries);
    println!("temperature: {}", summary.temperature);
    println!("threads: {}", summary.threads);
    println!("dataset: {}", summary.dataset_path.display());
    println!("tasks: {}", summary.task_count);
    println!("out_dir: {}", summary.out_dir.display());
    println!("model_name_or_path: {}", summary.model_name_or_path);
    println!("agent: {:?}", summary.agent_command);
    println!("testbed_namespace: {}", summary.testbed_namespace);
    println!("timeout_seconds: {}", summary.timeout_seconds);
}

fn print_outcome(outcome: &SweepOutcome) {
    println!("attempted: {}", outcome.attempted);
    println!("succeeded: {}", outcome.succeeded);
    println!("exhausted: {}", outcome.exhausted);
    println!("no_candidates: {}", outcome.no_candidates);
    println!("failed: {}", outcome.failed);
    println!("skipped_done: {}", outcome.skipped_done);
    println!("skipped_plausible: {}", outcome.skipped_plausible);
}

fn print_stats(stats: &ReportStats) {
    println!("total: {}", stats.total);
    println!("generated: {}", stats.generated);
    println!("no_generation: {}", stats.no_generation);
    println!("plausible: {}", stats.plausible);
    println!("resolved: {}", stats.resolved);
    println!("unresolved: {}", stats.unresolved);
    println!("unevaluated: {}", stats.unevaluated);
    println!("resolved_percent: {:.1}", stats.resolved_percent());
    println!("cost_spent: ${:.2}", stats.cost_spent);
    println!("cost_avg: ${:.2}/instance", stats.cost_avg);
    for (dname, count) in &stats.by_run_dir {
        println!("chosen_from {}: {}", dname, count);
    }
}
