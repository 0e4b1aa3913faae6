use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use dotenv::dotenv;
use imitate::bc::Trainer;
use imitate::config::{Args, RunConfig};
use imitate::env::UnityEnvironment;
use imitate::store::RunStore;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type Backend = Autodiff<NdArray>;

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("imitate=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging()?;

    let config = RunConfig::try_from(Args::parse())?;
    tracing::info!("{:?}", config);

    let store = RunStore::new(&config.model_dir, config.keep_checkpoints)?;
    let env = UnityEnvironment::launch(&config.env_path, config.worker_id, config.timeout_wait)?;
    tracing::info!("Training against academy {}", env.academy_name());

    let mut trainer = Trainer::<Backend, _>::new(config, store, Default::default());
    let report = trainer.run(env)?;

    tracing::info!(
        "Finished {} steps: {} expert pairs, {} updates, cumulative reward {:.2}",
        report.steps,
        report.expert_pairs,
        report.updates.iter().sum::<usize>(),
        report.cumulative_reward
    );
    for checkpoint in &report.checkpoints {
        tracing::debug!("Checkpoint {}", checkpoint.display());
    }
    if let Some(path) = &report.export_path {
        tracing::info!("Graph exported to {}", path.display());
    }

    Ok(())
}
