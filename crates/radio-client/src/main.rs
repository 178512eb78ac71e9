mod app;
mod connectivity;
mod error;
mod host;
mod http;
mod mpv;
mod poller;
mod schedule;
mod session;

use radio_proto::config::Config;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,radio_client=debug"));

    if config.log.to_file {
        let data_dir = radio_proto::platform::data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let log_path = data_dir.join("client.log");
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(log_file)
                    .with_ansi(false),
            )
            .with(filter)
            .init();
        info!("Log file: {:?}", log_path);
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first: it decides where logs go
    let config = Config::load()?;
    init_logging(&config)?;
    info!("Config loaded from: {:?}", Config::config_path());

    let ctx = app::AppContext::start(config).await?;
    info!("Client initialised, press Ctrl-C to quit");

    if ctx.config.session.autoplay {
        ctx.session.send(session::SessionCommand::Start(None)).await?;
    }

    tokio::signal::ctrl_c().await?;
    ctx.shutdown().await;
    Ok(())
}
