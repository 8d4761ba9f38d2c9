use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use silkcast::params::Codec;
use silkcast::session::SessionManager;
use silkcast::web::{self, AppState};

/// SilkCast command line arguments
#[derive(Parser, Debug)]
#[command(name = "silkcast")]
#[command(version, about = "Expose local capture devices as live network streams", long_about = None)]
struct CliArgs {
    /// Bind address
    #[arg(long, value_name = "IP", default_value = "0.0.0.0")]
    addr: String,

    /// Bind port
    #[arg(long, value_name = "PORT", default_value_t = 8080)]
    port: u16,

    /// Idle seconds before an unused device is released
    #[arg(long = "idle-timeout", value_name = "SECONDS", default_value_t = 10)]
    idle_timeout: u64,

    /// Default codec when a stream request does not specify one
    #[arg(long, value_name = "mjpeg|h264", default_value = "mjpeg")]
    codec: Codec,

    /// Run as a pull client against a running server instead of serving
    #[arg(long, value_name = "IP[:PORT]")]
    connect: Option<String>,

    /// Device consumed in pull-client mode
    #[arg(long, value_name = "DEVICE", default_value = "video0")]
    device: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging();

    if let Some(connect) = args.connect {
        #[cfg(feature = "h264")]
        return silkcast::client::run_client(&connect, &args.device).await;
        #[cfg(not(feature = "h264"))]
        anyhow::bail!("pull-client mode requires the h264 feature");
    }

    let sessions = SessionManager::new(Duration::from_secs(args.idle_timeout));
    let state = Arc::new(AppState {
        sessions: sessions.clone(),
        default_codec: args.codec,
    });

    let app = web::create_router(state);

    let addr: SocketAddr = format!("{}:{}", args.addr, args.port)
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid bind address {}:{}", args.addr, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        "silkcast listening on {} (idle-timeout={}s, default codec {})",
        addr,
        args.idle_timeout,
        args.codec
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Joins the reaper and stops every capture driver.
    sessions.shutdown();
    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "silkcast=info,tower_http=info".into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
