use yolo_train::{
    backend::{AutodiffTrainBackend, TrainBackend},
    common::CONFIG_FILE,
    config::{RunArgs, RunConfig},
    model::{TrainingSummary, train},
    sinks::{MetricHub, RunOutcome},
    tui::Visualizer,
    utils::env::EnvInfo,
};

use burn::{config::Config, tensor::backend::Backend};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use log::{error, info};
use std::{
    fs::{self, File},
    path::Path,
    sync::mpsc,
    thread,
};

const LOG_FILE: &str = "train.log";

/// Logs to stderr, or to `<logdir>/train.log` while the dashboard owns the terminal.
fn init_logging(logdir: &Path, to_file: bool) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if to_file {
        let path = logdir.join(LOG_FILE);
        let file = File::create(&path)
            .wrap_err_with(|| format!("Failed to create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn run_training(config: &RunConfig, hub: MetricHub) -> Result<TrainingSummary> {
    let device = <TrainBackend as Backend>::Device::default();
    info!("{}", EnvInfo::collect::<TrainBackend>(&device));
    info!("Metric sinks: {}", hub.sink_names().join(", "));

    let result = train::<AutodiffTrainBackend>(config, &hub, device);
    let outcome = match &result {
        Ok(_) => RunOutcome::Finished,
        Err(e) => {
            error!("Training failed: {e:?}");
            RunOutcome::Failed
        }
    };
    hub.shutdown(outcome);
    result
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = RunArgs::parse();
    let dashboard = args.tui;
    let config = args.into_config();

    let logdir = Path::new(&config.logdir);
    fs::create_dir_all(logdir)
        .wrap_err_with(|| format!("Failed to create log directory {}", logdir.display()))?;
    init_logging(logdir, dashboard)?;
    config
        .save(logdir.join(CONFIG_FILE))
        .wrap_err("Failed to save run config JSON")?;

    let summary = if dashboard {
        let (tx, rx) = mpsc::channel();
        let hub = MetricHub::from_config(&config, Some(tx))?;
        let worker_config = config.clone();
        let handle = thread::spawn(move || run_training(&worker_config, hub));

        let mut terminal = ratatui::init();
        let ui_result = Visualizer::new(rx).run(&mut terminal);
        ratatui::restore();
        ui_result?;
        if !handle.is_finished() {
            eprintln!("Dashboard closed; training continues, see {LOG_FILE} in the log directory.");
        }
        handle
            .join()
            .map_err(|_| eyre!("training thread panicked"))??
    } else {
        let hub = MetricHub::from_config(&config, None)?;
        run_training(&config, hub)?
    };

    info!(
        "Done: {} epochs, {} batches, {} optimizer steps, {} images seen, best mAP {}",
        summary.epochs,
        summary.batches,
        summary.optimizer_steps,
        summary.seen,
        summary
            .best_map
            .map(|m| format!("{m:.5}"))
            .unwrap_or_else(|| "-".into())
    );
    Ok(())
}
