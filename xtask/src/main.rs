use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod tasks;

#[derive(Parser)]
#[command(
    name = "stroke-seg",
    about = "Stroke segmentation and classification toolkit",
    author,
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert image / label folders into sharded TFRecord files.
    CreateRecords(tasks::records::RecordsArgs),
    /// Train a U-Net, Double U-Net or X-Net on segmentation records.
    TrainSegmentation(tasks::train::TrainArgs),
    /// Train the three-phase stroke classifier.
    TrainClassifier(tasks::classify::ClassifyArgs),
    /// Build a Double U-Net over every backbone and run one forward pass.
    CheckBackbones(tasks::check::CheckArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::CreateRecords(args) => tasks::records::run(args),
        Commands::TrainSegmentation(args) => tasks::train::run(args),
        Commands::TrainClassifier(args) => tasks::classify::run(args),
        Commands::CheckBackbones(args) => tasks::check::run(args),
    }
}
