//! Terminal output helpers.
//!
//! Uses `colored` for terminal output. Log lines go to stderr through
//! tracing; these helpers write the human-facing summary to stdout.

use colored::Colorize;

/// Print a success message.
pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// Print an error message.
pub fn error(msg: &str) {
    println!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Brand banner: ">> QNet node"
pub fn banner() {
    println!("  {} {}", ">>".bright_cyan().bold(), "QNet node".bold());
    println!("     {}", "Peer-to-peer messaging with per-peer keys".dimmed());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value);
}

/// Hint line: "  hint: message" in dimmed text.
pub fn hint(msg: &str) {
    println!("  {} {}", "hint:".dimmed(), msg.dimmed());
}

/// Red error + yellow "fix:" suggestion.
pub fn error_with_fix(msg: &str, fix: &str) {
    println!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
    println!("    {} {}", "fix:".bright_yellow(), fix);
}

/// Yellow warning + "try:" suggestion.
pub fn warn_with_fix(msg: &str, fix: &str) {
    println!("  {} {}", "-".bright_yellow(), msg.yellow());
    println!("    {} {}", "try:".bright_yellow(), fix);
}

/// Empty line.
pub fn blank() {
    println!();
}
