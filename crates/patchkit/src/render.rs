//! Terminal output for update events.

use std::fmt::Write as _;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use patchkit_core::{FileAction, PatchEvent, PlannedAction, RunOutcome, RunReport, UpdatePlan};

const SIZED_TEMPLATE: &str =
    "{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})";
const UNSIZED_TEMPLATE: &str = "{spinner:.green} {msg} {bytes} ({bytes_per_sec})";

pub struct Renderer {
    bar: ProgressBar,
    current_file: Option<String>,
    verbose: bool,
}

impl Renderer {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            current_file: None,
            verbose,
        }
    }

    pub fn handle(&mut self, event: &PatchEvent) {
        match event {
            PatchEvent::Status(message) => self.bar.set_message(message.clone()),
            PatchEvent::Transferred {
                file,
                downloaded,
                total,
            } => {
                if self.current_file.as_deref() != Some(file.as_str()) {
                    self.begin_file(file, *total);
                }
                self.bar.set_position(*downloaded);
            }
            PatchEvent::Progress(_) | PatchEvent::Finished(_) => {}
            PatchEvent::Error(failure) => {
                self.bar.println(format!("error: {}", failure.message));
                if self.verbose {
                    self.bar.println(format!("       {}", failure.detail));
                }
            }
        }
    }

    fn begin_file(&mut self, file: &str, total: Option<u64>) {
        self.current_file = Some(file.to_string());
        let message = self.bar.message();
        self.bar.finish_and_clear();
        let (bar, template) = match total {
            Some(total) => (ProgressBar::new(total), SIZED_TEMPLATE),
            None => (ProgressBar::new_spinner(), UNSIZED_TEMPLATE),
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_message(message);
        bar.enable_steady_tick(Duration::from_millis(100));
        self.bar = bar;
    }

    pub fn finish(self, report: &RunReport) {
        self.bar.finish_and_clear();
        print!("{}", summary(report));
    }
}

pub fn summary(report: &RunReport) -> String {
    let mut installed = 0;
    let mut up_to_date = 0;
    let mut failed = 0;
    for file in &report.files {
        match file.action {
            FileAction::Installed { .. } => installed += 1,
            FileAction::UpToDate => up_to_date += 1,
            FileAction::Failed { .. } => failed += 1,
            FileAction::Unpublished | FileAction::NotAttempted => {}
        }
    }

    let mut out = String::new();
    let headline = match report.outcome {
        RunOutcome::Succeeded => "Update complete",
        RunOutcome::Failed => "Update finished with errors",
        RunOutcome::Cancelled => "Update cancelled",
    };
    let _ = writeln!(
        out,
        "{headline}: {installed} installed, {up_to_date} up to date, {failed} failed ({} files)",
        report.total_files
    );
    for binding in report.environment.iter() {
        let _ = writeln!(out, "  {}={}", binding.key, binding.value);
    }
    out
}

pub fn plan_lines(plan: &UpdatePlan) -> String {
    let mut out = String::new();
    for file in &plan.files {
        let version = file.version.as_deref().unwrap_or("-");
        let action = match &file.action {
            PlannedAction::UpToDate => "up to date".to_string(),
            PlannedAction::Download { url } => format!("download {url}"),
            PlannedAction::Unpublished => "no published version".to_string(),
        };
        let _ = writeln!(out, "{:<24} {:<12} {action}", file.name, version);
    }
    let _ = writeln!(
        out,
        "{} of {} files need downloading",
        plan.downloads().count(),
        plan.files.len()
    );
    out
}
