pub mod definitions;
pub mod replay;
pub mod state;

pub use definitions::DefinitionsCommand;
pub use replay::ReplayCommand;
pub use state::StateCommand;

use std::path::PathBuf;

use clap::Args;
use temps_funnel_tracker::config::DEFAULT_API_URL;
use temps_funnel_tracker::TrackerConfig;

/// Connection and persistence settings shared by every command
#[derive(Args, Clone)]
pub struct TrackerArgs {
    /// Website the funnels belong to
    #[arg(long, env = "TEMPS_SITE_ID")]
    pub site_id: String,

    /// Base URL of the Temps collector
    #[arg(long, env = "TEMPS_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// File holding identifiers, cached definitions and funnel state
    #[arg(long, env = "TEMPS_FUNNEL_STATE_FILE", default_value = ".temps-funnels.json")]
    pub state_file: PathBuf,

    /// Verbose tracker diagnostics
    #[arg(long, env = "TEMPS_DEBUG")]
    pub debug: bool,
}

impl TrackerArgs {
    pub fn config(&self) -> TrackerConfig {
        TrackerConfig {
            api_url: self.api_url.clone(),
            debug: self.debug,
            ..TrackerConfig::new(self.site_id.clone())
        }
    }
}
