use std::sync::Arc;

use clap::Args;
use colored::Colorize;
use temps_funnel_tracker::types::StepCondition;
use temps_funnel_tracker::{DefinitionCache, FileStorage, ReqwestClient, SystemClock};
use tracing::debug;

use super::TrackerArgs;

#[derive(Args)]
pub struct DefinitionsCommand {
    #[command(flatten)]
    pub tracker: TrackerArgs,
}

impl DefinitionsCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = self.tracker.config();
        let site_id = config
            .site_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("A non-empty site id is required"))?;

        let http = Arc::new(ReqwestClient::new(config.request_timeout())?);
        let storage = Arc::new(FileStorage::new(&self.tracker.state_file));
        debug!("Using state file {}", storage.path().display());
        let cache = DefinitionCache::new(config, storage, http, Arc::new(SystemClock));

        let rt = tokio::runtime::Runtime::new()?;
        let definitions = rt.block_on(cache.load(&site_id));

        if !definitions.validated {
            println!(
                "{}",
                "Funnel definitions could not be loaded, see the log for details".bright_yellow()
            );
            return Ok(());
        }
        if definitions.funnels.is_empty() {
            println!("{}", format!("No active funnels for {}", site_id).dimmed());
            return Ok(());
        }

        for funnel in &definitions.funnels {
            println!(
                "{} {}",
                funnel.name.bright_white().bold(),
                format!("({})", funnel.id).dimmed()
            );
            for (index, step) in funnel.steps.iter().enumerate() {
                let condition = match step.condition() {
                    Some(StepCondition::Page { url }) => format!("page {}", url),
                    Some(StepCondition::Event { selector }) => format!("click {}", selector),
                    Some(StepCondition::Custom { event_name }) => format!("event {}", event_name),
                    None => "no condition".to_string(),
                };
                println!(
                    "  {} {} {}",
                    format!("{}.", index + 1).bright_cyan(),
                    step.label(),
                    condition.dimmed()
                );
            }
        }
        Ok(())
    }
}
