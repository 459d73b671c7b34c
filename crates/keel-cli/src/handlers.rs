//! Command handlers.

use crate::commands::{GlobalArgs, RunArgs};
use crate::config::CliConfig;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use keel_core::RunOptions;
use keel_engine::{Engine, EngineConfig, ListingEntry, RunOutcome};
use std::path::Path;
use std::time::Duration;

pub const TEMPLATE: &str = r#"branch: Main

nodes:
  - name: Compile
    commands:
      - mkdir -p out
      - echo "Building..." > out/build.txt
    products: [out/build.txt]

  - name: Test
    dependencies: [Compile]
    commands:
      - cat out/build.txt

  - name: Publish
    kind: trigger
    dependencies: [Test]

aggregates:
  - name: All
    dependencies: [Test, Publish]
"#;

/// Create a starter graph definition.
pub fn init(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    std::fs::write(path, TEMPLATE)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Load, link and schedule the graph definition.
pub fn validate(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let path = config.graph_path();
    let loaded = Engine::new(config).load()?;

    println!(
        "{} Graph {} for branch \"{}\" is valid",
        style("✓").green(),
        path.display(),
        loaded.branch
    );
    println!("  Nodes: {}", loaded.graph.len());
    println!("  Aggregates: {}", loaded.graph.aggregates().count());
    let triggers: Vec<&str> = loaded
        .graph
        .nodes()
        .filter(|node| node.is_trigger())
        .map(|node| node.name())
        .collect();
    if !triggers.is_empty() {
        println!("  Triggers: {}", triggers.join(", "));
    }
    Ok(())
}

/// Plan a run, print the listing, then carry it out.
pub async fn run(
    config: EngineConfig,
    args: &RunArgs,
    list_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = args.to_options()?;
    options.list_only |= list_only;

    let engine = Engine::new(config);
    let Some(plan) = engine.plan(&options).await? else {
        println!("{} Only placeholder nodes requested, nothing to do", style("i").blue());
        return Ok(());
    };
    for line in listing_lines(&plan.listing) {
        println!("{}", line);
    }

    let spinner = executes(&options).then(|| progress_spinner(plan.ordered.len()));
    let outcome = engine.execute(&plan, &options).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    for line in outcome_lines(&outcome?) {
        println!("{}", line);
    }
    Ok(())
}

/// Whether `options` lead to building or retrieving nodes.
pub fn executes(options: &RunOptions) -> bool {
    options.show_history.is_none()
        && !options.job_setup
        && options.save_graph.is_none()
        && !options.list_only
}

fn progress_spinner(nodes: usize) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Running {} nodes", nodes));
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// The plan listing, styled for the terminal.
pub fn listing_lines(entries: &[ListingEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let line = entry.to_string();
            match entry {
                ListingEntry::AggregatesHeader | ListingEntry::NodesHeader => {
                    style(line).bold().to_string()
                }
                ListingEntry::TriggerHeader { .. } => style(line).yellow().to_string(),
                ListingEntry::AgentGroup(_) => style(line).cyan().to_string(),
                ListingEntry::Node { complete: true, .. } => style(line).green().to_string(),
                ListingEntry::Agenda(_)
                | ListingEntry::Dependency { .. }
                | ListingEntry::History(_) => style(line).dim().to_string(),
                _ => line,
            }
        })
        .collect()
}

/// What to print once a run is over.
pub fn outcome_lines(outcome: &RunOutcome) -> Vec<String> {
    match outcome {
        RunOutcome::NothingToDo => vec![format!("{} Nothing to do", style("i").blue())],
        RunOutcome::Listed => Vec::new(),
        RunOutcome::History { node, lines } => {
            let mut out = vec![format!("History of {}:", style(node).bold())];
            out.extend(lines.iter().map(|line| format!("  {}", line)));
            out
        }
        RunOutcome::JobSteps { count, path } => vec![format!(
            "{} Planned {} job steps in {}",
            style("✓").green(),
            count,
            path.display()
        )],
        RunOutcome::GraphSaved { path } => vec![format!(
            "{} Saved graph to {}",
            style("✓").green(),
            path.display()
        )],
        RunOutcome::Executed(summary) => {
            let mut out = vec![format!(
                "{} Built {} nodes, retrieved {}",
                style("✓").green(),
                summary.built.len(),
                summary.retrieved.len()
            )];
            out.extend(summary.built.iter().map(|name| format!("  built     {}", name)));
            out.extend(
                summary
                    .retrieved
                    .iter()
                    .map(|name| format!("  retrieved {}", name)),
            );
            out
        }
    }
}

/// Show configuration.
pub fn show_config(
    config: &CliConfig,
    args: &GlobalArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let unset = || "(not set)".to_string();
    let shown = |path: &Option<std::path::PathBuf>| {
        path.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(unset)
    };
    println!("Current configuration:");
    println!("  graph: {}", shown(&config.graph));
    println!("  local_root: {}", shown(&config.local_root));
    println!("  shared_root: {}", shown(&config.shared_root));
    println!("  log_format: {:?}", config.log_format);

    let engine = config.engine_config(args)?;
    println!("\nEffective graph: {}", engine.graph_path().display());
    println!("Store prefix: {}", engine.store_prefix);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}
