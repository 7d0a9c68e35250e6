use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use cj_agents::workflow::WorkflowEngine;
use cj_core::types::{WorkflowOptions, WorkflowOutcome};

/// crackerjack — iterative quality enforcement for Python projects.
#[derive(Parser)]
#[command(name = "crackerjack", version, about)]
struct Cli {
    /// Project root to operate on.
    #[arg(short = 'p', long, default_value = ".")]
    project: PathBuf,

    /// Run the test suite between fast and comprehensive hooks.
    #[arg(short = 't', long)]
    run_tests: bool,

    /// Dispatch fixing agents against discovered issues.
    #[arg(long)]
    ai_fix: bool,

    /// Skip fast hooks and tests (comprehensive hooks still run).
    #[arg(long)]
    skip_hooks: bool,

    /// Override the auto-detected test worker count.
    #[arg(long)]
    test_workers: Option<usize>,

    /// Benchmark mode (serializes the test suite).
    #[arg(long)]
    benchmark: bool,

    /// Verbose progress reporting.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Iteration budget for the fix loop.
    #[arg(long, default_value_t = 10)]
    max_iterations: u32,

    /// Tolerate coverage regressions instead of failing the run.
    #[arg(long)]
    coverage_lax: bool,

    /// Compute every change without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Overall wall-clock budget in seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Restrict the test phase to tests matching this expression.
    #[arg(short = 'k', long)]
    test_pattern: Option<String>,

    /// Treat low-confidence unfixed issues as blocking.
    #[arg(long)]
    fail_on_unfixed: bool,

    /// Emit the full workflow result as JSON on stdout.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn options(&self) -> WorkflowOptions {
        WorkflowOptions {
            run_tests: self.run_tests,
            ai_fix: self.ai_fix,
            skip_hooks: self.skip_hooks,
            test_workers: self.test_workers,
            benchmark: self.benchmark,
            verbose: self.verbose,
            max_iterations: self.max_iterations,
            coverage_strict: !self.coverage_lax,
            dry_run: self.dry_run,
            deadline: self.deadline_secs.map(Duration::from_secs),
            test_pattern: self.test_pattern.clone(),
            fail_on_unfixed: self.fail_on_unfixed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if cli.verbose {
                    "debug".into()
                } else {
                    "info".into()
                }
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let engine = WorkflowEngine::new(&cli.project)?;
    let options = cli.options();
    let result = engine.run(options).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        report(&result);
    }

    let code = result.outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn report(result: &cj_core::types::WorkflowResult) {
    info!(
        outcome = ?result.outcome,
        iterations = result.iterations,
        issues = result.issues.len(),
        fixes = result.fixes.len(),
        duration_ms = result.total_duration_ms,
        "workflow finished"
    );

    for (phase, status) in &result.phases {
        println!("{phase}: {status:?}");
    }
    if !result.issues.is_empty() {
        println!("\nremaining issues:");
        for issue in &result.issues {
            match (&issue.file, issue.line) {
                (Some(file), Some(line)) => {
                    println!("  [{}] {}:{} {}", issue.kind, file.display(), line, issue.message)
                }
                (Some(file), None) => {
                    println!("  [{}] {} {}", issue.kind, file.display(), issue.message)
                }
                _ => println!("  [{}] {}", issue.kind, issue.message),
            }
        }
    }
    if let Some(metrics) = &result.metrics {
        println!(
            "\ncoverage {:.1}%  pass-rate {:.0}%  score {:.1}",
            metrics.coverage_percent,
            metrics.test_pass_rate * 100.0,
            metrics.score
        );
    }
    match result.outcome {
        WorkflowOutcome::Success => println!("\nall checks green"),
        outcome => println!("\nfinished: {outcome:?}"),
    }
}
