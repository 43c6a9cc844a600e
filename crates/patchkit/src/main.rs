//! `patchkit` keeps a game install in sync with its patch server.

mod error;
mod logging;
mod render;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info};
use patchkit_core::{
    CancellationPolicy, FailurePolicy, PatchErrorKind, PatchEvent, Patcher, RunOutcome, RunReport,
};

use crate::error::CliError;
use crate::render::Renderer;
use crate::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "patchkit", version, about = "Download and install game updates")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the install directory up to date.
    Update,
    /// Show what an update would download without changing anything.
    Plan {
        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
struct Overrides {
    /// Patch server base URL.
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Install directory.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Where a Ctrl+C is allowed to interrupt the run.
    #[arg(long, global = true, value_enum)]
    cancellation: Option<CancellationArg>,

    /// What to do with the remaining files after one fails.
    #[arg(long, global = true, value_enum)]
    on_failure: Option<FailureArg>,

    /// Also delete leftover contents of the scratch directory.
    #[arg(long, global = true)]
    purge_scratch: bool,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Persist these overrides to the settings file.
    #[arg(long, global = true)]
    save: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CancellationArg {
    Start,
    Files,
    Chunks,
}

impl From<CancellationArg> for CancellationPolicy {
    fn from(arg: CancellationArg) -> Self {
        match arg {
            CancellationArg::Start => Self::AtStart,
            CancellationArg::Files => Self::BetweenFiles,
            CancellationArg::Chunks => Self::BetweenChunks,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FailureArg {
    Continue,
    Abort,
}

impl From<FailureArg> for FailurePolicy {
    fn from(arg: FailureArg) -> Self {
        match arg {
            FailureArg::Continue => Self::Continue,
            FailureArg::Abort => Self::Abort,
        }
    }
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) {
        if let Some(base_url) = &self.base_url {
            settings.base_url = Some(base_url.clone());
        }
        if let Some(dir) = &self.dir {
            settings.install_dir.clone_from(dir);
        }
        if let Some(cancellation) = self.cancellation {
            settings.cancellation_policy = cancellation.into();
        }
        if let Some(on_failure) = self.on_failure {
            settings.failure_policy = on_failure.into();
        }
        settings.purge_scratch |= self.purge_scratch;
        settings.debug_logging |= self.debug;
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut settings = Settings::load();
    cli.overrides.apply(&mut settings);

    logging::init_logging(settings.debug_logging, settings.max_log_size_bytes);
    info!("patchkit {} starting", env!("CARGO_PKG_VERSION"));

    match run(&cli, &settings) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}

fn run(cli: &Cli, settings: &Settings) -> Result<ExitCode, CliError> {
    if cli.overrides.save {
        settings.save().map_err(CliError::SaveSettings)?;
    }

    let patcher = Patcher::with_http(settings.patch_config()?)?;
    match cli.command {
        Command::Update => update(&patcher, settings.debug_logging),
        Command::Plan { json } => plan(&patcher, json),
    }
}

fn update(patcher: &Patcher, verbose: bool) -> Result<ExitCode, CliError> {
    let stopper = patcher.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Stopping update...");
        stopper.stop();
    })?;

    let run = patcher.start()?;
    let mut renderer = Renderer::new(verbose);
    let mut report = None;
    for event in run.events() {
        match event {
            PatchEvent::Finished(finished) => report = Some(finished),
            other => renderer.handle(&other),
        }
    }
    let _ = run.wait();

    let report = report.ok_or(CliError::NoReport)?;
    renderer.finish(&report);

    Ok(ExitCode::from(report_exit_code(&report)))
}

/// Another process holding the install lock maps to `EX_TEMPFAIL`, like the
/// same error surfacing before the worker starts.
fn report_exit_code(report: &RunReport) -> u8 {
    if report
        .failures
        .iter()
        .any(|failure| failure.kind == PatchErrorKind::Busy)
    {
        return error::EX_TEMPFAIL;
    }
    match report.outcome {
        RunOutcome::Succeeded => 0,
        RunOutcome::Failed => 1,
        RunOutcome::Cancelled => 130,
    }
}

fn plan(patcher: &Patcher, json: bool) -> Result<ExitCode, CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    let plan = runtime.block_on(patcher.plan())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", render::plan_lines(&plan));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use patchkit_core::{
        CancellationPolicy, FailurePolicy, LaunchEnvironment, PatchErrorKind, PatchFailure,
        RunOutcome, RunReport,
    };

    use super::{Cli, Command, report_exit_code};
    use crate::settings::Settings;

    #[test]
    fn flags_override_loaded_settings() {
        let cli = Cli::parse_from([
            "patchkit",
            "update",
            "--base-url",
            "https://patches.example.net/",
            "--dir",
            "/opt/game",
            "--cancellation",
            "chunks",
            "--on-failure",
            "abort",
        ]);
        let mut settings = Settings::default();

        cli.overrides.apply(&mut settings);

        assert!(matches!(cli.command, Command::Update));
        assert_eq!(settings.base_url.as_deref(), Some("https://patches.example.net/"));
        assert_eq!(settings.install_dir, std::path::PathBuf::from("/opt/game"));
        assert_eq!(settings.cancellation_policy, CancellationPolicy::BetweenChunks);
        assert_eq!(settings.failure_policy, FailurePolicy::Abort);
    }

    #[test]
    fn absent_flags_keep_saved_values() {
        let cli = Cli::parse_from(["patchkit", "plan", "--json"]);
        let mut settings = Settings {
            base_url: Some("https://saved.example.net/".to_string()),
            debug_logging: true,
            ..Settings::default()
        };

        cli.overrides.apply(&mut settings);

        assert!(matches!(cli.command, Command::Plan { json: true }));
        assert_eq!(settings.base_url.as_deref(), Some("https://saved.example.net/"));
        assert!(settings.debug_logging);
    }

    fn report(outcome: RunOutcome, failures: &[PatchErrorKind]) -> RunReport {
        RunReport {
            outcome,
            total_files: 0,
            files: Vec::new(),
            failures: failures
                .iter()
                .map(|&kind| PatchFailure {
                    kind,
                    message: format!("{kind:?}"),
                    detail: String::new(),
                    file: None,
                })
                .collect(),
            environment: LaunchEnvironment::default(),
        }
    }

    #[test]
    fn run_outcomes_map_to_exit_codes() {
        assert_eq!(report_exit_code(&report(RunOutcome::Succeeded, &[])), 0);
        let failed = report(RunOutcome::Failed, &[PatchErrorKind::IntegrityMismatch]);
        assert_eq!(report_exit_code(&failed), 1);
        assert_eq!(report_exit_code(&report(RunOutcome::Cancelled, &[])), 130);
    }

    #[test]
    fn lock_held_elsewhere_is_a_temporary_failure() {
        let report = report(RunOutcome::Failed, &[PatchErrorKind::Busy]);

        assert_eq!(report_exit_code(&report), 75);
    }
}
