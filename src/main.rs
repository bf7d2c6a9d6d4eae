use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use geostage::{
    config::PipelineConfig,
    driver::CancellationToken,
    error::Result,
    input, logger, pipeline, post_processor,
    solver::ExternalSolver,
};

#[derive(Parser)]
#[command(name = "geostage")]
#[command(about = "Prepares and runs staged excavation analyses")]
struct Args {
    /// Model json with nodes, elements and materials
    model: PathBuf,

    /// Stage schedule json
    schedule: PathBuf,

    /// Pipeline configuration in TOML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the result csv files
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Stop after constraint synthesis and material conversion
    #[arg(long)]
    prepare_only: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn execute(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            PipelineConfig::from_file(path)?
        }
        None => PipelineConfig::default(),
    };

    let model = input::load_model(&args.model)?;
    let schedule = input::load_schedule(&args.schedule)?;
    let prepared = pipeline::prepare(model, &config)?;

    if args.prepare_only {
        prepared.ensure_materials()?;
        post_processor::write_all(&args.output, &[], &prepared.constraints, &prepared.warnings)?;
        return Ok(());
    }

    let mut solver = ExternalSolver::from_config(&config.solver)?;
    match pipeline::run(&prepared, &schedule, &mut solver, &config, CancellationToken::new()) {
        Ok(report) => {
            post_processor::write_all(
                &args.output,
                &report.stages,
                &prepared.constraints,
                &report.warnings,
            )?;
            info!(
                "finished {} stage(s) with {} warning(s)",
                report.stages.len(),
                report.warnings.total()
            );
            Ok(())
        }
        Err(failure) => {
            post_processor::write_all(
                &args.output,
                &failure.completed,
                &prepared.constraints,
                &failure.warnings,
            )?;
            Err(failure.error)
        }
    }
}

fn main() {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    if let Err(e) = execute(&args) {
        error!("{e}");
        std::process::exit(1);
    }
}
