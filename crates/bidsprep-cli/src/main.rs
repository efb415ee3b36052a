mod commands;
mod logging;
mod progress;

use std::process;
use std::sync::Arc;

use anyhow::Context;
use bidsprep_core::config::load_configuration;
use bidsprep_core::tsnr::table::ResultTable;
use bidsprep_core::tsnr::TsnrAggregator;
use bidsprep_core::{AppConfig, Pipeline, Registry, RunReport, Stage};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, SubjectArgs};
use dotenv::dotenv;
use progress::CliReporter;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let config = match load_configuration(args.config.as_deref(), args.root.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let report = match args.command {
        Some(Commands::Run { stages, subjects }) => {
            let stages = if stages.is_empty() {
                Stage::ALL.to_vec()
            } else {
                stages
                    .iter()
                    .map(|s| s.parse::<Stage>())
                    .collect::<Result<Vec<_>, _>>()?
            };
            run_stages(config, &stages, &subjects)?
        }
        Some(Commands::Stage(subjects)) => run_stages(config, &[Stage::Staging], &subjects)?,
        Some(Commands::Denoise(subjects)) => run_stages(config, &[Stage::Denoise], &subjects)?,
        Some(Commands::Quality(subjects)) => run_stages(config, &[Stage::Quality], &subjects)?,
        Some(Commands::Anat(subjects)) => run_stages(config, &[Stage::Anat], &subjects)?,
        Some(Commands::Register(subjects)) => {
            run_stages(config, &[Stage::Registration], &subjects)?
        }
        Some(Commands::Masks(subjects)) => run_stages(config, &[Stage::Masks], &subjects)?,
        Some(Commands::Tsnr(subjects)) => run_stages(config, &[Stage::Tsnr], &subjects)?,
        Some(Commands::ShowTsnr { subject }) => {
            show_tsnr(config, &subject)?;
            return Ok(());
        }
        Some(Commands::PrintConfig) => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        None => {
            let _ = Cli::command().print_long_help();
            return Ok(());
        }
    };

    print_summary(&report);
    if !report.succeeded() {
        process::exit(2);
    }
    Ok(())
}

fn run_stages(config: AppConfig, stages: &[Stage], args: &SubjectArgs) -> anyhow::Result<RunReport> {
    let registry_path = config.registry_path();
    let registry = Registry::load(&registry_path)
        .with_context(|| format!("loading {}", registry_path.display()))?
        .filtered(&args.subjects)?;

    let pipeline = Pipeline::system(config).with_reporter(Arc::new(CliReporter::new()));
    Ok(pipeline.run(&registry, stages)?)
}

fn show_tsnr(config: AppConfig, subject: &str) -> anyhow::Result<()> {
    let pipeline = Pipeline::system(config);
    let path = TsnrAggregator::new(pipeline.config(), pipeline.invoker()).table_path(subject);
    if !path.is_file() {
        anyhow::bail!("no tSNR table at {}", path.display());
    }
    let table = ResultTable::load(&path)?;
    print!("{}", table.render_text());
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    info!(
        "Started {}, took {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S"),
        format!("{:.2}s", report.duration.as_secs_f64()).green(),
    );
    info!(
        "{} subject(s), {} failure(s), {} tSNR row(s) added",
        format!("{}", report.subjects).cyan(),
        if report.failures.is_empty() {
            "0".green()
        } else {
            format!("{}", report.failures.len()).red()
        },
        format!("{}", report.tsnr_rows).cyan(),
    );
    for failure in &report.failures {
        error!("{}", failure.to_string().red());
    }
}
