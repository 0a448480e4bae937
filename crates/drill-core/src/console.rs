//! Human readable progress messages.
//!
//! Detailed logs go through `tracing` to the command log file; the console
//! only shows what a user watching the run needs to see.

use colored::Colorize;

/// Starts a new step.
pub fn step(msg: impl AsRef<str>) {
    println!("\n{}", format!("⭐ {}", msg.as_ref()).bold());
}

/// Reports progress inside a step.
pub fn pass(msg: impl AsRef<str>) {
    println!("   {} {}", "✅".green(), msg.as_ref());
}

/// Reports a failure inside a step.
pub fn error(msg: impl AsRef<str>) {
    println!("   {} {}", "❌".red(), msg.as_ref().red());
}

/// Reports a skipped item inside a step.
pub fn skip(msg: impl AsRef<str>) {
    println!("   {} {}", "⏭️".yellow(), msg.as_ref().dimmed());
}

/// Reports successful completion of the command.
pub fn completed(msg: impl AsRef<str>) {
    println!("\n{}", format!("✅ {}", msg.as_ref()).green().bold());
}
