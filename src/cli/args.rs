//! Command-line argument parsing

use crate::config::FetcherConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "docker-image-fetcher")]
#[command(about = "A service that fetches container images from Docker/OCI v2 registries")]
#[command(version, author)]
pub struct Args {
    /// Address to bind the control API to
    #[arg(long = "bind", default_value = "127.0.0.1")]
    pub bind: String,

    /// Port for the control API
    #[arg(long = "port", short = 'p', default_value = "8550")]
    pub port: u16,

    /// Root directory for task state and downloaded image content
    #[arg(long = "downloads-root", short = 'd', default_value = "downloads")]
    pub downloads_root: PathBuf,

    /// Maximum tasks fetching at once
    #[arg(long = "max-tasks", default_value = "3")]
    pub max_tasks: usize,

    /// Maximum parallel blob transfers within one task
    #[arg(long = "blobs-per-task", default_value = "5")]
    pub blobs_per_task: usize,

    /// Transient-failure retries per task
    #[arg(long = "retry", default_value = "3")]
    pub max_retries: u32,

    /// Park interrupted tasks as paused on startup instead of resuming them
    #[arg(long = "no-resume")]
    pub no_resume: bool,

    /// Enable verbose output
    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Suppress all non-error output
    #[arg(long = "quiet", short = 'q')]
    pub quiet: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tasks == 0 {
            return Err("max-tasks must be greater than 0".to_string());
        }
        if self.blobs_per_task == 0 {
            return Err("blobs-per-task must be greater than 0".to_string());
        }
        if self.verbose && self.quiet {
            return Err("verbose and quiet are mutually exclusive".to_string());
        }
        Ok(())
    }

    /// Build the engine configuration; environment variables win over
    /// defaults and flags.
    pub fn to_config(&self) -> FetcherConfig {
        let mut config = FetcherConfig::default()
            .with_downloads_root(self.downloads_root.clone())
            .with_max_concurrent_tasks(self.max_tasks)
            .with_blobs_per_task(self.blobs_per_task)
            .with_max_retries(self.max_retries)
            .with_resume_on_start(!self.no_resume)
            .with_verbose(self.verbose)
            .with_quiet(self.quiet);
        config.bind_address = self.bind.clone();
        config.port = self.port;
        config.from_env()
    }
}
