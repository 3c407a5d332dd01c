use clap::Parser;

use feedq_worker::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    feedq_observability::init();

    let cli = Cli::parse();
    feedq_worker::app::run(cli).await
}
