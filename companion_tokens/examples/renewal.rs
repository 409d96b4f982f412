use std::time::Duration;

use clap::Parser;
use companion_reqwest::{build_client, NetworkConfig};
use companion_tokens::{
    challenge::BotguardClient, jitter, metrics::FailureCounter, platform::InnertubeClient,
    GenerationConfig, InvalidVideoId, Orchestrator, RenewalSchedule, SandboxLimits, VideoId,
};
use std::sync::Arc;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// A proxy to route all outbound requests through
    #[clap(short, long, env)]
    proxy: Option<String>,

    /// The search query used to find videos to validate tokens against
    #[clap(short = 'q', long, env, default_value = "news")]
    validation_query: String,

    /// Seconds between renewals
    #[clap(short, long, env, default_value_t = 300)]
    interval_secs: u64,

    /// The video to mint content tokens for
    #[clap(short, long, env, value_parser = parse_video_id, default_value = "dQw4w9WgXcQ")]
    video_id: VideoId,
}

fn parse_video_id(raw: &str) -> Result<VideoId, InvalidVideoId> {
    VideoId::new(raw.to_owned())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let network = NetworkConfig::default().with_optional_proxy(opts.proxy);
    let client = build_client(&network)?;
    let failures = Arc::new(FailureCounter::new());

    let orchestrator = Orchestrator::builder(
        BotguardClient::new(client.clone()),
        InnertubeClient::new(client),
    )
    .with_generation_config(
        GenerationConfig::default().with_validation_query(opts.validation_query),
    )
    .with_sandbox_limits(SandboxLimits::default().with_user_agent(network.user_agent()))
    .with_network_config(network)
    .with_metrics(failures.clone())
    .spawn();

    let mut minter = orchestrator.minter();
    let _schedule = RenewalSchedule::spawn(
        orchestrator.clone(),
        Duration::from_secs(opts.interval_secs),
        jitter::RandomEarlyJitter::new(Duration::from_secs(30)),
    );

    let generation = minter.changed().await?;
    let handle = minter.current()?;
    tracing::info!(
        generation.id = %generation,
        session = format_args!("{:#?}", handle.session()),
        "first session token"
    );

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        match minter.mint_content_token(&opts.video_id).await {
            Ok(token) => tracing::debug!(
                generation.id = %minter.current()?.generation(),
                token = format_args!("{:#?}", token),
                "minted content token"
            ),
            Err(error) => tracing::error!(
                error = (&error as &dyn std::error::Error),
                failures = failures.failures(),
                "unable to mint content token"
            ),
        }

        for status in orchestrator.generations().await {
            tracing::trace!(
                generation.id = %status.generation,
                generation.state = %status.state,
                age_ms = status.age.as_millis() as u64,
                "generation"
            );
        }
    }
}
