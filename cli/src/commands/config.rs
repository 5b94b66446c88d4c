use anyhow::Result;
use colored::Colorize;
use stepwise_core::StepwiseConfig;

/// Print the effective configuration (file, defaults and environment).
pub fn execute(config: &StepwiseConfig) -> Result<()> {
    let mut shown = config.clone();
    if shown.backend.api_key.is_some() {
        shown.backend.api_key = Some("********".to_string());
    }

    println!("{}", "# effective configuration".dimmed());
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}
