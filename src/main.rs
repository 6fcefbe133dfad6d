use std::sync::Arc;

use bridge_config::{LogFormat, Logging};
use bridge_service::{Bridge, MemoryTokenCache, SecretsManagerProvider, SystemClock};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

fn init_logging(logging: &Logging) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    // The platform stamps each log line already.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time();
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cfg = bridge_config::load_from_env()?;
    init_logging(&cfg.logging);

    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let secrets = SecretsManagerProvider::new(aws_sdk_secretsmanager::Client::new(&aws));
    let bridge = Arc::new(Bridge::new(
        &cfg,
        Arc::new(secrets),
        Arc::new(MemoryTokenCache::default()),
        Arc::new(SystemClock),
    )?);

    tracing::info!(
        event_name = "bridge.cold_start",
        secret_name_set = cfg.secret_name.is_some(),
        timeout_ms = cfg.http.timeout_ms,
        "callback bridge initialized"
    );

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let bridge = Arc::clone(&bridge);
        async move {
            let span = tracing::info_span!("invocation", request_id = %event.context.request_id);
            bridge
                .handle_value(event.payload)
                .instrument(span)
                .await
                .map_err(Error::from)
        }
    }))
    .await
}
