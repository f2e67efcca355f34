use agentwire_core::{Config, Paths};

/// Show the effective configuration as pretty-printed JSON.
pub async fn show(init: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let file = paths.config_file();

    if init {
        if file.exists() {
            println!("Config already exists at {}", file.display());
        } else {
            config.save(&file)?;
            println!("✓ Wrote default config to {}", file.display());
        }
    }

    println!();
    println!("📋 Current Configuration");
    println!("  File: {}", file.display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
