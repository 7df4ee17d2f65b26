use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use vdbio::compression::compression_to_string;
use vdbio::{Archive, InStream, MetaMap};

#[derive(Parser)]
#[command(name = "vdbio")]
#[command(about = "Inspect VDB archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the archive header: versions, UUID, compression.
    Info { input: PathBuf },
    /// List the grids in an archive.
    List { input: PathBuf },
    /// Print the archive-level metadata map.
    DumpMeta { input: PathBuf },
}

fn open(input: &PathBuf) -> std::io::Result<InStream<'static>> {
    Ok(InStream::new(BufReader::new(File::open(input)?)))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    vdbio::initialize();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Info { input } => {
            let mut is = open(input)?;
            let mut archive = Archive::new();
            archive.read_header(&mut is)?;
            println!("--- VDB Archive Info ---");
            println!("Version:      {}", archive.version());
            println!("UUID:         {}", archive.unique_tag());
            println!("Grid offsets: {}", archive.input_has_grid_offsets());
            println!(
                "Compression:  {}",
                compression_to_string(archive.compression())
            );
        }
        Commands::List { input } => {
            let mut is = open(input)?;
            let mut archive = Archive::new();
            let (_, grids) = archive.read(&mut is)?;
            println!("{:<20} {:<20} {:<12} {:>12}", "Name", "Type", "Class", "Voxels");
            for grid in &grids {
                println!(
                    "{:<20} {:<20} {:<12} {:>12}",
                    grid.name(),
                    grid.grid_type(),
                    grid.grid_class().as_str(),
                    grid.active_voxel_count()
                );
            }
        }
        Commands::DumpMeta { input } => {
            let mut is = open(input)?;
            let mut archive = Archive::new();
            archive.read_header(&mut is)?;
            let meta = MetaMap::read_meta(&mut is)?;
            print!("{}", meta.str_indented(""));
        }
    }
    Ok(())
}
