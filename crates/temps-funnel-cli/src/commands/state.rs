use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use temps_funnel_tracker::storage::{queue_key, state_key, SESSION_ID_KEY, VISITOR_ID_KEY};
use temps_funnel_tracker::{FileStorage, FunnelRuntimeState, QueuedEvent, Storage};

#[derive(Args)]
pub struct StateCommand {
    /// Website the funnels belong to
    #[arg(long, env = "TEMPS_SITE_ID")]
    pub site_id: String,

    /// File holding identifiers, cached definitions and funnel state
    #[arg(long, env = "TEMPS_FUNNEL_STATE_FILE", default_value = ".temps-funnels.json")]
    pub state_file: PathBuf,

    /// Print raw JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

impl StateCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let storage = FileStorage::new(&self.state_file);

        let states: BTreeMap<String, FunnelRuntimeState> =
            match storage.get(&state_key(&self.site_id))? {
                Some(raw) => {
                    serde_json::from_str(&raw).context("Persisted funnel state is corrupt")?
                }
                None => BTreeMap::new(),
            };
        let outbox: Vec<QueuedEvent> = match storage.get(&queue_key(&self.site_id))? {
            Some(raw) => serde_json::from_str(&raw).context("Persisted funnel outbox is corrupt")?,
            None => Vec::new(),
        };

        if self.json {
            let document = serde_json::json!({
                "visitor_id": storage.get(VISITOR_ID_KEY)?,
                "session_id": storage.get(SESSION_ID_KEY)?,
                "funnels": states,
                "outbox": outbox,
            });
            println!("{}", serde_json::to_string_pretty(&document)?);
            return Ok(());
        }

        let visitor = storage.get(VISITOR_ID_KEY)?.unwrap_or_else(|| "-".to_string());
        let session = storage
            .get(SESSION_ID_KEY)?
            .unwrap_or_else(|| "expired".to_string());
        println!("{} {}", "Visitor:".bright_white().bold(), visitor.bright_cyan());
        println!("{} {}", "Session:".bright_white().bold(), session.bright_cyan());
        println!();

        if states.is_empty() {
            println!("{}", "No funnel state persisted".dimmed());
        }
        for (funnel_id, state) in &states {
            let last_activity = state
                .last_activity
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "{} step {} completed {:?} converted {} {}",
                funnel_id.bright_white().bold(),
                state.current_step,
                state.completed_steps,
                state.converted,
                format!("last activity {}", last_activity).dimmed()
            );
        }

        println!();
        if outbox.is_empty() {
            println!("{}", "Outbox is empty".bright_green());
        } else {
            println!(
                "{}",
                format!("{} undelivered events", outbox.len()).bright_yellow()
            );
            for event in &outbox {
                println!(
                    "  {} {} step {} at {}",
                    event.event_type.to_string().bold(),
                    event.funnel_id,
                    event.step_number,
                    event.timestamp.to_rfc3339()
                );
            }
        }
        Ok(())
    }
}
