use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aq_forecast::config::AppConfig;
use aq_forecast::evaluation::metrics_summary;
use aq_forecast::ml::ModelParams;
use aq_forecast::ml::persistence::load_bundle;
use aq_forecast::service::ForecastService;
use aq_forecast::training::search::ParamGrid;
use aq_forecast::training::{ModelTrainer, PreparedData};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "aq-forecast")]
#[command(about = "NO2 and O3 forecasting: training, evaluation and prediction")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the configured model (or several) and save bundles
    Train {
        /// CSV file or directory of per-site CSV files
        #[arg(long)]
        data: Option<PathBuf>,
        /// JSON array of model parameter sets to train in turn
        #[arg(long)]
        multi: Option<PathBuf>,
    },
    /// Grid search over model parameters scored by validation RMSE
    Search {
        /// JSON object mapping parameter names to candidate values
        #[arg(long)]
        grid: PathBuf,
        #[arg(long)]
        trials: Option<usize>,
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Evaluate a saved model bundle on the test split
    Evaluate {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Forecast at a location and print the result as JSON
    Predict {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        #[arg(long, default_value_t = 24)]
        hours: usize,
        #[arg(long)]
        uncertainty: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("aq_forecast=debug");

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    match args.command {
        Command::Train { data, multi } => run_train(config, data, multi),
        Command::Search { grid, trials, data } => run_search(config, &grid, trials, data),
        Command::Evaluate { model, data } => run_evaluate(config, &model, data),
        Command::Predict {
            lat,
            lon,
            hours,
            uncertainty,
        } => run_predict(&config, lat, lon, hours, uncertainty),
    }
}

fn prepare(trainer: &ModelTrainer, data: Option<PathBuf>) -> Result<PreparedData> {
    let path = data.unwrap_or_else(|| trainer.config().data.path.clone());
    let segments = ModelTrainer::load_segments(&path)
        .with_context(|| format!("Failed to load data from {}", path.display()))?;
    trainer.prepare_data(segments).context("Failed to prepare training data")
}

fn run_train(config: AppConfig, data: Option<PathBuf>, multi: Option<PathBuf>) -> Result<()> {
    let mut trainer = ModelTrainer::new(config);
    let prepared = prepare(&trainer, data)?;

    let outcomes = match multi {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let configs: Vec<ModelParams> =
                serde_json::from_str(&text).context("Failed to parse model configurations")?;
            trainer.train_multiple_models(configs, &prepared)
        }
        None => vec![
            trainer
                .train_model(trainer.config().model.clone(), &prepared, true)
                .context("Training failed")?,
        ],
    };
    for outcome in &outcomes {
        tracing::info!(
            model = %outcome.model_name,
            epochs = outcome.history.epochs(),
            bundle = ?outcome.bundle_dir,
            "Training complete"
        );
    }

    if let Some(test) = &prepared.test {
        for (name, report) in trainer.evaluate_models(test, prepared.target_names()) {
            println!("{name}");
            println!("{}", serde_json::to_string_pretty(&metrics_summary(&report))?);
        }
    }
    Ok(())
}

fn run_search(config: AppConfig, grid: &Path, trials: Option<usize>, data: Option<PathBuf>) -> Result<()> {
    let n_trials = trials.unwrap_or(config.training.search_trials);
    let grid = ParamGrid::load(grid).context("Failed to load search grid")?;
    let mut trainer = ModelTrainer::new(config);
    let prepared = prepare(&trainer, data)?;

    let outcome = trainer
        .hyperparameter_search(&grid, n_trials, &prepared)
        .context("Hyperparameter search failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome.trials)?);
    println!("{}", serde_json::to_string_pretty(&outcome.best_params)?);
    tracing::info!(score = outcome.best_score, bundle = ?outcome.best.bundle_dir, "Best configuration");
    Ok(())
}

fn run_evaluate(config: AppConfig, model: &Path, data: Option<PathBuf>) -> Result<()> {
    let bundle = load_bundle(model).with_context(|| format!("Failed to load {}", model.display()))?;
    tracing::info!("{}", bundle.metadata.summary());

    let path = data.unwrap_or_else(|| config.data.path.clone());
    let segments = ModelTrainer::load_segments(&path)
        .with_context(|| format!("Failed to load data from {}", path.display()))?;
    let mut trainer = ModelTrainer::new(config);
    let report = trainer
        .evaluate_bundle(&bundle, segments)
        .context("Evaluation failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_predict(config: &AppConfig, lat: f64, lon: f64, hours: usize, uncertainty: bool) -> Result<()> {
    let service = ForecastService::load(config).context("Failed to start forecast service")?;
    let result = service
        .predict(lat, lon, hours, uncertainty)
        .context("Prediction failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
