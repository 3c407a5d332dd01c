use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "feedq-worker")]
#[command(about = "Background worker that turns queued subjects into model feedback")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Poll the queue until interrupted (default)
    Run,

    /// Process a single batch and exit
    Once,

    /// Queue a subject for analysis
    Enqueue {
        subject_id: Uuid,
        /// Rate-limit bucket (e.g. author or assignment)
        #[arg(long)]
        group: Option<String>,
    },

    /// Print job counts by status as JSON
    Stats,

    /// Print one job as JSON
    Show { job_id: Uuid },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
