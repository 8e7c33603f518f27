use anyhow::Result;
use clap::{Parser, Subcommand};
use planship_ado::AdoClient;
use planship_engine::{Engine, PublishOptions};
use planship_ports::ConsoleLogger;
use planship_redact::redact;
use std::path::PathBuf;

mod config;

#[derive(Parser, Debug)]
#[command(name = "planship")]
#[command(about = "Sync JUnit results and Gherkin scenarios into Azure DevOps test plans.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a JUnit result file as a test run and reconcile failure tasks.
    Publish {
        /// Path to the JUnit XML result file.
        #[arg(long, default_value = "results.xml")]
        junit_file: PathBuf,
        /// Target test plan name, or "auto-generate".
        #[arg(long, default_value = "auto-generate")]
        plan_name: String,
        /// Target test suite name, or "auto-generate".
        #[arg(long, default_value = "auto-generate")]
        suite_name: String,
        /// Also upload the result file as a run attachment.
        #[arg(long)]
        attach_results: bool,
        /// Directory with per-test artifact files to attach to results.
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
        /// Artifact filename pattern; {testName} is replaced per test.
        #[arg(long, default_value = "{testName}.png")]
        artifact_pattern: String,
    },

    /// Push Gherkin scenario steps/tags/descriptions into tagged test cases.
    SyncFeatures {
        /// Glob pattern for feature files.
        #[arg(long, default_value = "features/**/*.feature")]
        pattern: String,
    },
}

fn main() {
    if let Err(e) = run() {
        // The top-level catch-all is also a log sink; scrub it.
        eprintln!("ERROR: {}", redact(&format!("{e:#}")));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let env = config::load_environment()?;

    let logger = ConsoleLogger;
    let client = AdoClient::new(&env.org_url, &env.project, &env.token)?;
    let engine = Engine::new(
        &client,
        &client,
        &client,
        &logger,
        &env.project,
        env.policy.clone(),
        env.build.clone(),
    );

    match cli.cmd {
        Command::Publish {
            junit_file,
            plan_name,
            suite_name,
            attach_results,
            artifacts_dir,
            artifact_pattern,
        } => {
            let options = PublishOptions {
                results_file: junit_file,
                plan_name: config::resolve_generated_name(
                    &plan_name,
                    "AutoPlan",
                    &env.build.build_number,
                ),
                suite_name: config::resolve_generated_name(
                    &suite_name,
                    "AutoSuite",
                    &env.build.build_number,
                ),
                attach_results,
                artifacts_dir,
                artifact_pattern,
            };

            let summary = engine.publish_results(&options)?;
            println!(
                "parsed {} result(s); published {} ({} unplanned)",
                summary.parsed, summary.published, summary.unplanned
            );
            if summary.failure_tasks_processed > 0 {
                println!(
                    "reconciled failure tasks for {} failed test(s)",
                    summary.failure_tasks_processed
                );
            }
            if summary.pass_resolutions > 0 {
                println!(
                    "checked auto-close for {} passed test(s)",
                    summary.pass_resolutions
                );
            }
            match summary.run {
                Some(run) => println!("run {}: {}", run.run_id, run.run_url),
                None => println!("no run was published"),
            }
        }

        Command::SyncFeatures { pattern } => {
            let summary = engine.sync_features(&pattern)?;
            println!(
                "scenarios: {}, updated: {}, skipped: {}",
                summary.scenarios, summary.updated, summary.skipped
            );
        }
    }

    Ok(())
}
