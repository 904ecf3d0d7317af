use std::net::SocketAddr;

use clap::{Arg, Command};
use tracing::info;

use device_streamer::app::init_logging;
use device_streamer::mock_server::MockIngestServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info");

    let matches = Command::new("mock-ingest")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Local ingest server that accepts device-streamer uploads")
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Listen address")
                .default_value("0.0.0.0:5000")
                .value_parser(clap::value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("status")
                .long("status")
                .value_name("CODE")
                .help("HTTP status returned for every upload")
                .default_value("200")
                .value_parser(clap::value_parser!(u16).range(100..600)),
        )
        .get_matches();

    let bind = matches
        .get_one::<SocketAddr>("bind")
        .copied()
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 5000)));
    let status = matches.get_one::<u16>("status").copied().unwrap_or(200);

    let server = MockIngestServer::bind(bind).await?;
    server.set_status(status);
    info!("Viewer endpoints: http://{}/img, /audio, /video, /stats", server.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, final stats: {:?}", server.stats());
    server.shutdown().await;
    Ok(())
}
