use crate::config::CheckArgs;
use crate::error::ServerError;
use stream_engine::config::StreamConfig;

pub fn run(args: CheckArgs) -> Result<(), ServerError> {
    let config = StreamConfig::load(&args.config)?;
    let settings = config.settings()?;
    let topology = config.topology()?;
    tracing::info!(
        config = %args.config,
        computations = topology.computations().len(),
        streams = topology.streams().len(),
        "config is valid"
    );
    println!("{}", topology.to_plantuml(&settings));
    Ok(())
}
