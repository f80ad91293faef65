//! Default configuration command

use anyhow::Result;
use hypercmtl::ExperimentConfig;

/// Print the default experiment configuration
pub fn run() -> Result<()> {
    println!("{}", ExperimentConfig::default().to_json_string()?);
    Ok(())
}
