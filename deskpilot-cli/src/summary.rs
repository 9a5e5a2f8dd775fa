use colored::*;
use deskpilot::{Report, RunStatus, StepStatus};

/// Longest error text shown per step before it is cut.
const ERROR_PREVIEW: usize = 400;

fn preview(text: &str) -> String {
    if text.chars().count() <= ERROR_PREVIEW {
        return text.to_string();
    }
    let cut: String = text.chars().take(ERROR_PREVIEW).collect();
    format!("{cut}...")
}

/// Prints a run report to stdout.
pub fn display(report: &Report) {
    println!();
    println!("{}", "═".repeat(60));

    match report.status {
        RunStatus::Passed => println!("{} {}", "✅ PASSED:".green().bold(), report.scenario),
        RunStatus::Failed => println!("{} {}", "❌ FAILED:".red().bold(), report.scenario),
    }

    println!("{}", "─".repeat(60));
    println!("📊 Run Details:");
    println!("   • Run id: {}", report.run_id);
    println!("   • Started: {}", report.started_at);
    println!("   • Steps executed: {}", report.steps.len());
    println!("   • Duration: {:.2}s", report.duration_sec);

    if !report.steps.is_empty() {
        println!("{}", "─".repeat(60));
        println!("🧾 Steps:");
        for step in &report.steps {
            let mark = match step.status {
                StepStatus::Passed => "✓".green(),
                StepStatus::Failed => "✗".red(),
            };
            println!(
                "   {mark} {:>3}. {} {}",
                step.index,
                step.keyword.bold(),
                format!("({:.2}s)", step.duration_sec).dimmed()
            );
            if let Some(error) = &step.error {
                for line in preview(error).lines() {
                    println!("         {}", line.red());
                }
            }
            if let Some(trace) = &step.action_trace {
                for line in trace.lines() {
                    println!("         {}", line.dimmed());
                }
            }
        }
    }

    // run-level errors that did not belong to any step, e.g. schema failures
    let orphans: Vec<&String> = report
        .errors
        .iter()
        .filter(|e| !report.steps.iter().any(|s| s.error.as_ref() == Some(*e)))
        .collect();
    if !orphans.is_empty() {
        println!("{}", "─".repeat(60));
        println!("⚠️  Errors:");
        for error in orphans {
            for line in preview(error).lines() {
                println!("   {}", line.red());
            }
        }
    }

    println!("{}", "═".repeat(60));
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_cuts_long_errors() {
        let long = "x".repeat(ERROR_PREVIEW + 10);
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), ERROR_PREVIEW + 3);
        assert_eq!(preview("short"), "short");
    }
}
