//! Snapshot CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::cli::output::{output, CommandOutput};
use crate::cli::table::{list_table, render_list};
use crate::domain::ports::SnapshotStore;
use crate::infrastructure::snapshot::FileSnapshotStore;
use crate::services::snapshot::RuntimeSnapshot;

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub command: SnapshotCommands,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Summarize a snapshot file
    Inspect {
        /// Path to the snapshot file
        path: PathBuf,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct SnapshotAgentRow {
    pub id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub knowledge_keys: usize,
    pub history: usize,
}

#[derive(Debug, serde::Serialize)]
pub struct SnapshotInspectOutput {
    pub path: String,
    pub schema_version: u32,
    pub taken_at: String,
    pub next_agent_id: u64,
    pub agents: Vec<SnapshotAgentRow>,
    pub cache_items: usize,
    pub pattern_centers: usize,
}

impl CommandOutput for SnapshotInspectOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Snapshot {}", self.path),
            format!("  Schema version:   {}", self.schema_version),
            format!("  Taken at:         {}", self.taken_at),
            format!("  Cache items:      {}", self.cache_items),
            format!("  Pattern centers:  {}", self.pattern_centers),
            String::new(),
        ];

        let mut table = list_table(&["id", "type", "capabilities", "knowledge", "history"]);
        for agent in &self.agents {
            table.add_row(vec![
                agent.id.clone(),
                agent.agent_type.clone(),
                agent.capabilities.join(","),
                agent.knowledge_keys.to_string(),
                agent.history.to_string(),
            ]);
        }
        lines.push(render_list("agent", &table, self.agents.len()));
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: SnapshotArgs, json_mode: bool) -> Result<()> {
    match args.command {
        SnapshotCommands::Inspect { path } => {
            let store = FileSnapshotStore::new(&path);
            let bytes = store
                .load()
                .await
                .with_context(|| format!("Failed to read snapshot {}", path.display()))?
                .with_context(|| format!("No snapshot at {}", path.display()))?;
            let snapshot = RuntimeSnapshot::decode(&bytes)
                .with_context(|| format!("Failed to decode snapshot {}", path.display()))?;
            output(&inspect(&path, &snapshot), json_mode);
        }
    }
    Ok(())
}

fn inspect(path: &std::path::Path, snapshot: &RuntimeSnapshot) -> SnapshotInspectOutput {
    SnapshotInspectOutput {
        path: path.display().to_string(),
        schema_version: snapshot.schema_version,
        taken_at: snapshot.taken_at.to_rfc3339(),
        next_agent_id: snapshot.next_agent_id,
        agents: snapshot
            .agents
            .iter()
            .map(|agent| SnapshotAgentRow {
                id: agent.id.to_string(),
                agent_type: agent.agent_type.clone(),
                capabilities: agent.capabilities.to_strings(),
                knowledge_keys: agent.knowledge_base.len(),
                history: agent.performance_history.len(),
            })
            .collect(),
        cache_items: snapshot.cache.items.len(),
        pattern_centers: snapshot.cache.centers.len(),
    }
}
