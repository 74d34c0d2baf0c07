use comms::Transport;
use log::info;
use secure_nn::{ExecutionContext, ReferenceNet, SecretPipeline, SharedOpFactory};

use crate::{
    PartyErr, Result,
    config::PartyConfig,
    coordinator::PartyCoordinator,
    data::DataLoader,
    training::{TrainingLoop, TrainingState},
};

/// Runs a whole party over an already connected link.
///
/// # Arguments
/// * `config` - The validated configuration of this role.
/// * `link` - The transport to the other roles, its role must match the configuration.
///
/// # Returns
/// The final training counters.
pub async fn run<T: Transport>(config: &PartyConfig, link: T) -> Result<TrainingState> {
    let role = link.role();
    if role != config.role {
        return Err(PartyErr::Config(format!(
            "the link is connected as {role}, the configuration says {}",
            config.role
        )));
    }

    let pipeline = config.arch.build()?;
    let input = pipeline
        .input_shape()
        .ok_or_else(|| PartyErr::Config("the network has no layers".into()))?;
    let classes = pipeline
        .output_shape()
        .map_or(0, |shape| shape.per_sample());
    info!(role = role.id(); "built {} layers, input {input}", pipeline.len());

    let dataset = config.data.load(input.sample_dims(), classes)?;
    let loader = DataLoader::new(dataset, input.batch())?;

    let mut training = TrainingLoop::new(loader, config.training.epochs)
        .with_batch_limit(config.training.max_batches);
    if config.training.compare && role.sees_plaintext() {
        training = training.with_reference(ReferenceNet::new(&pipeline, config.seed)?);
    }

    let factory = SharedOpFactory::new(config.seed);
    let secret = SecretPipeline::bind(pipeline, &factory, role)?;
    let mut coordinator = PartyCoordinator::new(ExecutionContext::new(link), secret);

    let state = training.run(&mut coordinator).await?;
    info!(
        role = role.id(), executed = state.executed, skipped = state.skipped;
        "done, mean loss {:?}", state.mean_loss()
    );

    coordinator.shutdown().await?;
    Ok(state)
}
