use crate::attribution::events::RunEvent;
use crate::ui::icons::{CROSS, SPARKLE, step_icon};
use console::style;
use eventsense_common::{Run, RunStatus, StepStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal progress for a single attribution run, rendered via `indicatif`.
///
/// Two bars are stacked:
/// - Step bar: settled steps out of the pipeline length
/// - Activity spinner: the step currently being worked
///
/// Events arrive from the run store subscription and are applied in order.
pub struct RunProgressUI {
    multi: MultiProgress,
    step_bar: ProgressBar,
    activity: ProgressBar,
    labels: Vec<String>,
}

impl RunProgressUI {
    pub fn new(labels: Vec<String>) -> Self {
        let multi = MultiProgress::new();

        let step_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let step_bar = multi.add(ProgressBar::new(labels.len() as u64));
        step_bar.set_style(step_style);
        step_bar.set_prefix("Steps");

        let activity_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let activity = multi.add(ProgressBar::new_spinner());
        activity.set_style(activity_style);
        activity.set_prefix("  Now");

        Self {
            multi,
            step_bar,
            activity,
            labels,
        }
    }

    /// Same event handling with nothing drawn, for machine-readable output.
    pub fn hidden(labels: Vec<String>) -> Self {
        let multi = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let step_bar = multi.add(ProgressBar::hidden());
        step_bar.set_length(labels.len() as u64);
        let activity = multi.add(ProgressBar::hidden());
        Self {
            multi,
            step_bar,
            activity,
            labels,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.step_bar.is_hidden() {
            return;
        }
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn label(&self, step: u32) -> &str {
        self.labels
            .get(step.saturating_sub(1) as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }

    /// Settled steps seen so far.
    pub fn settled(&self) -> u64 {
        self.step_bar.position()
    }

    pub fn apply(&self, event: &RunEvent) {
        match event {
            RunEvent::RunCreated { ticker, .. } => {
                self.step_bar.set_message(style(ticker).yellow().to_string());
            }
            RunEvent::RunStarted { .. } => {
                self.activity.enable_steady_tick(Duration::from_millis(100));
            }
            RunEvent::StepStarted { step, label, .. } => {
                self.activity.set_message(format!(
                    "{} {}",
                    style(format!("[{}]", step)).cyan(),
                    label
                ));
            }
            RunEvent::StepFinished { step, status, .. } => {
                self.step_bar.inc(1);
                let label = self.label(*step);
                let line = match status {
                    StepStatus::Done => format!("  {}{}", step_icon(*status), label),
                    StepStatus::Skipped => {
                        format!("  {}{}", step_icon(*status), style(label).dim())
                    }
                    _ => format!("  {}{}", step_icon(*status), style(label).red()),
                };
                self.print_line(line);
            }
            RunEvent::RunFinished { .. } => {
                self.activity.finish_and_clear();
            }
        }
    }

    /// Close the bars and print a one-line outcome.
    pub fn finish(&self, run: &Run) {
        self.activity.finish_and_clear();
        self.step_bar.finish();
        match (run.status, &run.error) {
            (RunStatus::Done, _) => {
                self.print_line(format!(
                    "{}{} {} attributed",
                    SPARKLE,
                    style(&run.params.ticker).bold(),
                    run.params.selected_day_et
                ));
            }
            (_, Some(error)) => {
                self.print_line(format!(
                    "{}{}: {}",
                    CROSS,
                    style(error.kind).red().bold(),
                    error.detail
                ));
            }
            _ => {}
        }
    }
}
