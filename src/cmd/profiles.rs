//! List scan profiles and their execution waves: `reconflow profiles`.

use anyhow::Result;
use console::style;
use reconflow::config::ReconConfig;

pub fn cmd_profiles(project_dir: &std::path::Path) -> Result<()> {
    let config = ReconConfig::new(project_dir.to_path_buf())?;
    let pipelines = config.toml.pipelines();

    println!();
    for name in pipelines.names() {
        match pipelines.resolve(name) {
            Ok(definition) => {
                println!("{}", style(name).bold().cyan());
                for (i, wave) in definition.graph().compute_waves().iter().enumerate() {
                    let stages: Vec<String> = wave
                        .iter()
                        .map(|kind| {
                            let policy = definition.policy(*kind);
                            format!(
                                "{} ({}s, {}x)",
                                kind,
                                policy.timeout.as_secs(),
                                policy.max_attempts
                            )
                        })
                        .collect();
                    println!("  wave {}: {}", i + 1, stages.join(", "));
                }
            }
            Err(e) => {
                println!("{} {}", style(name).bold().red(), style("(invalid)").red());
                println!("  {}", e);
            }
        }
        println!();
    }
    Ok(())
}
