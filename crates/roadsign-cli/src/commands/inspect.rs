use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use roadsign_convert::{Artifact, artifact::DType};

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Quantized `.rsq` artifact.
    artifact: PathBuf,

    /// Print the raw JSON header.
    #[arg(long)]
    json: bool,
}

pub fn run(args: InspectArgs) -> anyhow::Result<()> {
    let artifact = Artifact::read_file(&args.artifact)
        .with_context(|| format!("Unable to read {}", args.artifact.display()))?;
    let header = artifact.header();

    if args.json {
        println!("{}", serde_json::to_string_pretty(header)?);
        return Ok(());
    }

    println!("{} ({} bytes)", args.artifact.display(), artifact.encoded_len()?);
    for spec in [&header.input, &header.output] {
        println!(
            "{:<8} {:?} {:?} {}",
            spec.name, spec.shape, spec.dtype, spec.layout
        );
    }

    println!("ops:");
    for op in &header.ops {
        println!("  {}", serde_json::to_string(op)?);
    }

    println!("tensors:");
    for entry in &header.tensors {
        let scales = match entry.dtype {
            DType::I8 => {
                let (min, max) = entry
                    .scales
                    .iter()
                    .fold((f32::INFINITY, 0.0f32), |(min, max), s| (min.min(*s), max.max(*s)));
                format!(" scales [{min:.3e}, {max:.3e}]")
            }
            DType::F32 => String::new(),
        };
        println!(
            "  {:<14} {:?} {:?} {} bytes{scales}",
            entry.name, entry.dtype, entry.shape, entry.length
        );
    }

    Ok(())
}
