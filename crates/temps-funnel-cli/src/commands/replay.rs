use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use temps_funnel_tracker::{
    Element, FileStorage, FunnelEventType, FunnelTracker, History, InteractionBus, QueuedEvent,
};
use tracing::{debug, info};

use super::TrackerArgs;

/// Time given to the driver after a navigation so the settle timer fires
/// before the next script line
const NAVIGATION_PAUSE: Duration = Duration::from_millis(150);

#[derive(Args)]
pub struct ReplayCommand {
    #[command(flatten)]
    pub tracker: TrackerArgs,

    /// JSON-lines script, one action per line
    #[arg(long)]
    pub script: PathBuf,

    /// URL the simulated page starts on
    #[arg(long, default_value = "/")]
    pub start_url: String,
}

/// One line of a replay script
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScriptAction {
    Navigate(String),
    Replace(String),
    Back,
    Forward,
    Click(Element),
    Custom(String),
    /// Milliseconds
    Wait(u64),
    Step {
        funnel_id: String,
        step: usize,
    },
    Convert {
        funnel_id: String,
        #[serde(default)]
        value: Option<f64>,
        #[serde(default)]
        data: Option<Value>,
    },
    Unload,
}

fn parse_script(source: &str) -> anyhow::Result<Vec<ScriptAction>> {
    source
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid script action on line {}: {}", number, line))
        })
        .collect()
}

fn print_event(event: &QueuedEvent) {
    let label = match event.event_type {
        FunnelEventType::Progress => "progress".bright_cyan(),
        FunnelEventType::Dropoff => "dropoff".bright_yellow(),
        FunnelEventType::Conversion => "conversion".bright_green(),
    };
    println!(
        "{} {} {} {}",
        "→".bright_white(),
        label.bold(),
        format!("funnel {}", event.funnel_id).bright_white(),
        format!("step {} ({})", event.step_number, event.step_name).dimmed()
    );
}

async fn replay(
    tracker: &FunnelTracker,
    history: &History,
    interactions: &InteractionBus,
    actions: Vec<ScriptAction>,
) {
    for action in actions {
        debug!("Replaying {:?}", action);
        match action {
            ScriptAction::Navigate(url) => {
                history.push_state(url);
                tokio::time::sleep(NAVIGATION_PAUSE).await;
            }
            ScriptAction::Replace(url) => {
                history.replace_state(url);
                tokio::time::sleep(NAVIGATION_PAUSE).await;
            }
            ScriptAction::Back => {
                history.back();
                tokio::time::sleep(NAVIGATION_PAUSE).await;
            }
            ScriptAction::Forward => {
                history.forward();
                tokio::time::sleep(NAVIGATION_PAUSE).await;
            }
            ScriptAction::Click(target) => interactions.click(target),
            ScriptAction::Custom(name) => interactions.custom(name),
            ScriptAction::Wait(millis) => tokio::time::sleep(Duration::from_millis(millis)).await,
            ScriptAction::Step { funnel_id, step } => {
                if !tracker.track_step(&funnel_id, step) {
                    println!(
                        "{}",
                        format!("Step {} of funnel {} was not accepted", step, funnel_id).dimmed()
                    );
                }
            }
            ScriptAction::Convert {
                funnel_id,
                value,
                data,
            } => {
                tracker.track_conversion(&funnel_id, value, data);
            }
            ScriptAction::Unload => tracker.handle_unload(),
        }
    }
}

impl ReplayCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let source = std::fs::read_to_string(&self.script)
            .with_context(|| format!("Failed to read script {}", self.script.display()))?;
        let actions = parse_script(&source)?;
        info!("Replaying {} actions from {}", actions.len(), self.script.display());

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let history = Arc::new(History::new(self.start_url.clone()));
            let interactions = Arc::new(InteractionBus::new());
            let storage = Arc::new(FileStorage::new(&self.tracker.state_file));

            let tracker = FunnelTracker::builder(self.tracker.config())
                .storage(storage)
                .navigation(history.clone())
                .interactions(interactions.clone())
                .build()
                .await
                .ok_or_else(|| anyhow::anyhow!("A non-empty site id is required"))?;

            tracker
                .signals()
                .subscribe(Arc::new(|event: &QueuedEvent| print_event(event)));
            tracker.spawn_driver();

            replay(&tracker, &history, &interactions, actions).await;
            tracker.teardown().await;

            println!();
            for funnel in tracker.active_funnels() {
                let Some(state) = tracker.funnel_state(&funnel.id) else {
                    continue;
                };
                let status = if state.converted {
                    "converted".bright_green()
                } else if state.is_started() {
                    "in progress".bright_cyan()
                } else {
                    "not started".dimmed()
                };
                println!(
                    "{} {} step {}/{} {}",
                    funnel.name.bright_white().bold(),
                    format!("({})", funnel.id).dimmed(),
                    state.current_step,
                    funnel.step_count(),
                    status
                );
            }

            let pending = tracker.pending_events().len();
            if pending > 0 {
                println!(
                    "{}",
                    format!("{} events could not be delivered and were kept for later", pending)
                        .bright_yellow()
                );
            }
            Ok::<(), anyhow::Error>(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_actions() {
        let script = r##"
# comment lines and blanks are skipped

{"navigate": "/cart"}
"back"
{"click": {"tag": "button", "id": "pay", "classes": ["primary"]}}
{"custom": "signup"}
{"wait": 250}
{"step": {"funnel_id": "F1", "step": 2}}
{"convert": {"funnel_id": "F1", "value": 19.5}}
"unload"
"##;

        let actions = parse_script(script).unwrap();
        assert_eq!(actions.len(), 8);
        assert!(matches!(&actions[0], ScriptAction::Navigate(url) if url == "/cart"));
        assert!(matches!(actions[1], ScriptAction::Back));
        assert!(matches!(&actions[2], ScriptAction::Click(el) if el.id.as_deref() == Some("pay")));
        assert!(matches!(actions[4], ScriptAction::Wait(250)));
        assert!(matches!(
            &actions[6],
            ScriptAction::Convert { value: Some(v), data: None, .. } if *v == 19.5
        ));
    }

    #[test]
    fn test_parse_script_reports_line_number() {
        let err = parse_script("{\"navigate\": \"/\"}\n{\"teleport\": 1}").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
