//! Output formatting for the CLI.

use clap::ValueEnum;
use serde::Serialize;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Print output in the specified format.
pub fn print<T>(value: &T, format: OutputFormat)
where
    T: Serialize + std::fmt::Display + std::fmt::Debug,
{
    match format {
        OutputFormat::Text => println!("{}", value),
        OutputFormat::Json => print_json(value),
    }
}

/// Print a value as pretty JSON, falling back to its debug form.
pub fn print_json<T: Serialize + std::fmt::Debug>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{:?}", value),
    }
}

/// Format a label/value row.
pub fn row(label: &str, value: impl std::fmt::Display) -> String {
    format!("  {:<16} {}", format!("{}:", label), value)
}

/// Format a heading with a divider.
pub fn heading(text: &str) -> String {
    format!("{}\n{}", text, "-".repeat(50))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_pads_labels() {
        assert_eq!(row("claimed", 3), "  claimed:         3");
    }

    #[test]
    fn heading_has_divider() {
        let text = heading("Events");
        assert!(text.starts_with("Events\n"));
        assert!(text.ends_with(&"-".repeat(50)));
    }
}
