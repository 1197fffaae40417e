//! Shared status icons with plain-text fallbacks.

use console::Emoji;

use eventsense_common::StepStatus;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

/// Icon for a settled or in-flight step.
pub fn step_icon(status: StepStatus) -> Emoji<'static, 'static> {
    match status {
        StepStatus::Done => CHECK,
        StepStatus::Error => CROSS,
        StepStatus::Skipped => SKIP,
        StepStatus::Running | StepStatus::Pending => RUNNING,
    }
}
