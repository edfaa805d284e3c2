use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser)]
#[command(
    name = "docker-registry",
    version,
    about = "Standalone content-addressed Docker Registry v1 server",
    long_about = None
)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_path() {
        let cli = Cli::parse_from(["docker-registry"]);
        assert_eq!(cli.config, PathBuf::from(config::DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn config_flag_overrides_default() {
        let cli = Cli::parse_from(["docker-registry", "--config", "/tmp/cfg.json"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/cfg.json"));
    }
}
