//! Command execution

use tracing::info;

use vconn_core::MessengerConfig;

use crate::cli::{Commands, ConfigAction, Preset};
use crate::config::CliAppConfig;
use crate::error::Result;
use crate::simulation::run_simulation;

pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Run `command` and return what should be printed on stdout
    pub async fn execute(command: Commands, config: CliAppConfig) -> Result<String> {
        match command {
            Commands::Simulate {
                members,
                clients,
                messages,
                sever,
                pretty,
            } => {
                let mut sim = config.simulation.clone();
                if let Some(members) = members {
                    sim.members = members;
                }
                if let Some(clients) = clients {
                    sim.clients = clients;
                }
                if let Some(messages) = messages {
                    sim.messages_per_peer = messages;
                }
                let report = run_simulation(&sim, &config.messenger, sever).await?;
                if !report.is_complete() {
                    info!(
                        delivered = report.delivered,
                        expected = report.expected_deliveries,
                        "simulation incomplete"
                    );
                }
                let json = if pretty {
                    serde_json::to_string_pretty(&report)?
                } else {
                    serde_json::to_string(&report)?
                };
                Ok(json)
            }
            Commands::Config { action } => match action {
                ConfigAction::Show { preset } => {
                    let shown = match preset {
                        Preset::Default => CliAppConfig::default(),
                        Preset::Testing => CliAppConfig::with_messenger(MessengerConfig::testing()),
                        Preset::Strict => CliAppConfig::with_messenger(MessengerConfig::strict()),
                        Preset::Effective => config,
                    };
                    shown.to_toml()
                }
                ConfigAction::Check { path } => {
                    let checked = CliAppConfig::load_from_file(&path)?;
                    Ok(format!(
                        "{}: ok (messenger '{}', {} members, {} clients)",
                        path,
                        checked.messenger.name,
                        checked.simulation.members,
                        checked.simulation.clients
                    ))
                }
            },
        }
    }
}
