//! Verify command implementation.

use super::format_size;
use crate::error::CliError;
use atelier_core::{verify_store, VerifyReport};
use std::path::Path;

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), CliError> {
    println!("Verifying store at {}", path.display());
    println!();

    let report = verify_store(path)?;
    print_report(&report);
    println!();
    check(&report)?;
    println!("✓ Store verification passed");
    Ok(())
}

/// Fails on damage before the tail. A torn tail is cut away on the next open.
pub(crate) fn check(report: &VerifyReport) -> Result<(), CliError> {
    match &report.error {
        Some(error) => {
            println!("✗ Store verification failed");
            Err(CliError::VerifyFailed(error.clone()))
        }
        None => Ok(()),
    }
}

fn print_report(report: &VerifyReport) {
    println!("  Log size:   {}", format_size(report.log_bytes));
    println!("  Frames:     {}", report.frames);
    println!("  Operations: {}", report.operations);
    if let Some(error) = &report.error {
        println!(
            "    ERROR after {} valid bytes: {}",
            report.valid_bytes, error
        );
    } else if report.torn_bytes() > 0 {
        println!(
            "  Torn tail:  {} (cut away on next open)",
            format_size(report.torn_bytes())
        );
    }
}
