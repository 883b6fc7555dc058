#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use crate::command::{get, init, server};
use crate::configuration::{Configuration, ObservabilityConfig};
use argh::FromArgs;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

mod command;
mod configuration;
mod metrics_provider;
mod ntp;
mod secret;
mod tls;
mod watcher;

fn set_tracing(config: Option<ObservabilityConfig>) -> Result<(), configuration::Error> {
    if let Some(ObservabilityConfig {
        tracing: Some(tracing_config),
    }) = config
    {
        let resource = Resource::builder()
            .with_service_name(env!("CARGO_PKG_NAME"))
            .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
            .build();
        let otlp_exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&tracing_config.endpoint)
            .with_timeout(std::time::Duration::from_secs(10))
            .build()?;

        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(otlp_exporter)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .with_sampler(Sampler::TraceIdRatioBased(tracing_config.sampling_rate))
            .build();

        let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));
        let _ = global::set_tracer_provider(tracer_provider);
        let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().json())
            .with(telemetry)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    }
    Ok(())
}

#[derive(FromArgs, PartialEq, Debug)]
/// Kubernetes TokenReview webhook authenticating users against external identity providers
struct GlobalArguments {
    #[argh(option, short = 'c', default = "String::from(\"config.toml\")")]
    /// the path to the configuration file, defaults to `config.toml`
    config: String,

    #[argh(subcommand)]
    subcommand: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Run(server::Options),
    Init(init::Options),
    Get(get::Options),
}

fn main() -> Result<(), command::Error> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli_args: GlobalArguments = argh::from_env();

    match cli_args.subcommand {
        SubCommand::Init(options) => {
            set_tracing(None)?;
            init::Command::run(options)
        }
        SubCommand::Get(options) => {
            set_tracing(None)?;
            get::Command::run(options)
        }
        SubCommand::Run(_) => {
            let config = Configuration::load(&cli_args.config)?;

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("Failed to create Tokio runtime")
                .block_on(run_server(config))
        }
    }
}

async fn run_server(config: Configuration) -> Result<(), command::Error> {
    set_tracing(config.observability.clone())?;

    let server = server::Command::new(&config)?;
    server.run().await
}
