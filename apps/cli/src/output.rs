//! Output formatting utilities

use crate::OutputFormat;
use console::Term;
use serde::Serialize;

/// Print output in the specified format.
///
/// Goes to stderr when stdout carries downloaded data.
pub fn print_output<T: Serialize + std::fmt::Display>(
    value: &T,
    format: OutputFormat,
    to_stderr: bool,
) -> anyhow::Result<()> {
    let term = if to_stderr {
        Term::stderr()
    } else {
        Term::stdout()
    };
    match format {
        OutputFormat::Json => term.write_line(&serde_json::to_string_pretty(value)?)?,
        OutputFormat::Human => term.write_line(&value.to_string())?,
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1024), "1 KiB");
    }
}
