use anyhow::Result;
use tch::Device;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod constants;
mod dataset;
mod generate;
mod model;
mod tokenizer;
mod train;

use constants::{DATA_DIR, EPOCHS};
use dataset::MelodyDataset;
use train::MelodyTrainer;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "melodygen=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let device = Device::cuda_if_available();
    info!("using device: {:?}", device);

    let dataset = MelodyDataset::new(DATA_DIR)?;
    info!(
        "loaded melody corpus: vocabulary of {} tokens, sequences padded to {}",
        dataset.vocab_size(),
        dataset.max_melody_length()
    );

    let mut trainer = MelodyTrainer::new(device, dataset)?;
    trainer.train(EPOCHS);

    info!("generating a melody");
    let generator = trainer.into_generator();
    let start_sequence = ["C4-1.0", "D4-1.0", "E4-1.0", "C4-1.0"].map(String::from);
    let new_melody = generator.generate(&start_sequence)?;
    info!("generated melody: {}", new_melody);

    Ok(())
}
