//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No results found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(&items),
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    if let Ok(json) = serde_json::to_string_pretty(value) {
        println!("{}", json);
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format seconds as a short human-readable duration
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{:.1}s", seconds);
    }
    // Whole seconds, truncated, so a component never reaches 60
    let total = seconds.floor() as u64;
    if total >= 3600 {
        format!("{}h{:02}m", total / 3600, (total % 3600) / 60)
    } else {
        format!("{}m{:02}s", total / 60, total % 60)
    }
}

/// Color a scenario status string
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "passed" => status.green().to_string(),
        "partial" | "timeout" => status.yellow().to_string(),
        "failed" | "error" => status.red().to_string(),
        "skipped" => status.dimmed().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(4.3), "4.3s");
        assert_eq!(format_duration(75.0), "1m15s");
        assert_eq!(format_duration(3720.0), "1h02m");
    }

    #[test]
    fn test_format_duration_never_shows_sixty() {
        assert_eq!(format_duration(119.7), "1m59s");
        assert_eq!(format_duration(7199.9), "1h59m");
        assert_eq!(format_duration(60.0), "1m00s");
    }

    #[test]
    fn test_color_status_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(color_status("passed"), "passed");
        assert_eq!(color_status("unknown"), "unknown");
    }
}
