use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bidsprep")]
#[command(about = "Stage MRI sessions into BIDS, denoise them and measure tSNR", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./Pipeline.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Study root, overriding the configured one
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Args)]
pub struct SubjectArgs {
    /// Only process these subjects (repeatable); all registry subjects otherwise
    #[arg(long = "subject", short = 's')]
    pub subjects: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline stages in order for every subject
    Run {
        /// Stages to run (repeatable); all stages otherwise
        #[arg(long = "stage")]
        stages: Vec<String>,
        #[command(flatten)]
        subjects: SubjectArgs,
    },
    /// Copy raw scans into the BIDS tree and complete their sidecars
    Stage(SubjectArgs),
    /// Run every NORDIC variant on the functional data
    Denoise(SubjectArgs),
    /// Run MRIQC on the raw dataset and each denoised derivative
    Quality(SubjectArgs),
    /// Anatomical preprocessing with fMRIPrep and FreeSurfer
    Anat(SubjectArgs),
    /// Register functional, anatomical and standard space
    Register(SubjectArgs),
    /// Build region masks in functional space
    Masks(SubjectArgs),
    /// Measure tSNR of every processing variant
    Tsnr(SubjectArgs),
    /// Print the tSNR table of a subject
    ShowTsnr {
        subject: String,
    },
    /// Print configuration values
    PrintConfig,
}
