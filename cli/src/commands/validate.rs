use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use stepwise_core::TemplateStore;

/// Load a template, run structural validation and print its outline.
pub fn execute(template_path: &Path) -> Result<()> {
    let store = TemplateStore::load(template_path)
        .with_context(|| format!("Invalid template {}", template_path.display()))?;
    let template = store.snapshot();

    println!("{} {}", "Template".bold(), template.name.cyan());
    for stage in &template.stages {
        let title = stage.title.as_deref().unwrap_or("");
        println!("  {} {}", stage.id.yellow(), title.dimmed());
        if stage.steps.is_empty() {
            println!("    {}", "(no steps: this stage will fail when entered)".red());
        }
        for (index, step) in stage.steps.iter().enumerate() {
            println!(
                "    {}. {} {} {}",
                index + 1,
                step.id,
                step.title.as_deref().unwrap_or("").dimmed(),
                format!("[{}]", step.first_behavior_id()).dimmed()
            );
        }
    }

    println!("{}", "Template is valid".green());
    Ok(())
}
