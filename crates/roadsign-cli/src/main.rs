mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "roadsign", version, about = "Traffic-sign classifier tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the classifier on an annotated image folder.
    Train(commands::train::TrainArgs),
    /// Classify an image with a checkpoint or a quantized artifact.
    Predict(commands::predict::PredictArgs),
    /// Import a PyTorch state dict into a checkpoint.
    #[cfg(feature = "pytorch")]
    ImportPytorch(commands::import::ImportArgs),
    /// Convert a checkpoint into a validated channel-last int8 artifact.
    Convert(commands::convert::ConvertArgs),
    /// Print the header of a quantized artifact.
    Inspect(commands::inspect::InspectArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Train(args) => commands::train::run(args),
        Command::Predict(args) => commands::predict::run(args),
        #[cfg(feature = "pytorch")]
        Command::ImportPytorch(args) => commands::import::run(args),
        Command::Convert(args) => commands::convert::run(args),
        Command::Inspect(args) => commands::inspect::run(args),
    }
}
