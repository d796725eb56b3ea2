//! Console summary output.

use console::style;

use crate::runner::results::{ResultKind, ResultSet, TaskResult};

/// Prints the batch summary to stdout and returns `true` when every
/// execution succeeded.
pub fn print_summary(results: &ResultSet) -> bool {
    let mut providers: Vec<&String> = results.by_provider().keys().collect();
    providers.sort();

    let mut all_ok = true;

    for provider in providers {
        println!();
        println!("{}", style(provider).bold());

        let provider_results = results.provider(provider).unwrap_or(&[]);
        for run in runs_in_order(provider_results) {
            let of_run: Vec<&TaskResult> = provider_results
                .iter()
                .filter(|r| r.run_name == run)
                .collect();
            let count = |kind: ResultKind| of_run.iter().filter(|r| r.kind == kind).count();
            let successes = count(ResultKind::Success);
            let failures = count(ResultKind::Failure);
            let errors = count(ResultKind::Error);
            let unsupported = count(ResultKind::NotSupported);
            if failures + errors + unsupported > 0 {
                all_ok = false;
            }

            println!(
                "  {}: {} passed, {} failed, {} errors, {} not supported",
                style(&run).cyan(),
                style(successes).green(),
                style(failures).red(),
                style(errors).red().bold(),
                style(unsupported).yellow(),
            );

            for result in &of_run {
                if result.kind == ResultKind::Success {
                    continue;
                }
                println!(
                    "    {} {} ({:.2?})",
                    style(format!("[{}]", result.kind)).red(),
                    result.task_name,
                    result.duration
                );
                if let Some(error) = &result.details.error {
                    println!("      {}", style(&error.message).dim());
                } else {
                    println!(
                        "      got:  {}\n      want: {}",
                        style(&result.got).dim(),
                        style(result.want.join(" | ")).dim()
                    );
                }
            }
        }
    }

    println!();
    if results.is_empty() {
        println!("{}", style("No results.").yellow());
    } else if all_ok {
        println!("{}", style("All evaluations passed.").green().bold());
    } else {
        println!("{}", style("Some evaluations did not pass.").red().bold());
    }

    all_ok
}

/// Run names in first-appearance order for one provider's result list.
fn runs_in_order(results: &[TaskResult]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut runs = Vec::new();
    for result in results {
        if seen.insert(result.run_name.as_str()) {
            runs.push(result.run_name.clone());
        }
    }
    runs
}
