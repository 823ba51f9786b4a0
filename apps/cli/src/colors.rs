//! Status colors and small formatting helpers for terminal output.

use clipforge_core::{BudgetHealth, JobStatus};
use colored::{Color, ColoredString, Colorize};
use comfy_table::{Cell, Color as TableColor};

/// Primary accent, cyan.
pub const PRIMARY_RGB: (u8, u8, u8) = (0, 217, 255);

/// Table cell in the primary accent.
pub fn primary_cell(text: impl ToString) -> Cell {
    let (r, g, b) = PRIMARY_RGB;
    Cell::new(text).fg(TableColor::Rgb { r, g, b })
}

/// Color used for a job status.
pub fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Pending => Color::Yellow,
        JobStatus::Processing => Color::Blue,
        JobStatus::Completed => Color::Green,
        JobStatus::Failed => Color::Red,
        JobStatus::Cancelled => Color::Magenta,
    }
}

/// Same palette for table cells.
pub fn status_table_color(status: JobStatus) -> TableColor {
    match status {
        JobStatus::Pending => TableColor::Yellow,
        JobStatus::Processing => TableColor::Blue,
        JobStatus::Completed => TableColor::Green,
        JobStatus::Failed => TableColor::Red,
        JobStatus::Cancelled => TableColor::Magenta,
    }
}

/// Colored upper-case status label.
pub fn status_label(status: JobStatus) -> ColoredString {
    status.as_str().to_uppercase().color(status_color(status)).bold()
}

/// Colored budget health.
pub fn health_label(health: BudgetHealth) -> ColoredString {
    let text = health.to_string();
    match health {
        BudgetHealth::OverBudget => text.red().bold(),
        BudgetHealth::Warning => text.red(),
        BudgetHealth::Caution => text.yellow(),
        BudgetHealth::OnTrack | BudgetHealth::WellUnder => text.green(),
    }
}

/// USD with cents.
pub fn money(amount: f64) -> String {
    format!("${:.2}", amount)
}

/// USD with three decimals, for per-job figures.
pub fn money_fine(amount: f64) -> String {
    format!("${:.3}", amount)
}

/// Shortens `text` to `max` characters, adding an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
