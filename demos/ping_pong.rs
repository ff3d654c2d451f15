use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use udt_transport::condition::TransportCondition;
use udt_transport::config::{TransportConfig, IMMEDIATE_TIMEOUT};
use udt_transport::test_util::MemoryNetwork;
use udt_transport::transport::{MessageHandler, MessageInfo, Response, UdtTransport};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 3)]
    num_pings: usize,

    #[clap(long, default_value_t = 5000)]
    response_timeout_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct PongServer;

impl MessageHandler for PongServer {
    fn on_message_received(&self, message: &[u8], info: &MessageInfo) -> Option<Response> {
        info!("server received {:?} from {:?}", String::from_utf8_lossy(message), info.endpoint);
        Some(Response::new(format!("pong: {}", String::from_utf8_lossy(message)), IMMEDIATE_TIMEOUT))
    }
}

struct PingClient {
    responses: mpsc::UnboundedSender<Result<String, TransportCondition>>,
}

impl MessageHandler for PingClient {
    fn on_message_received(&self, message: &[u8], _info: &MessageInfo) -> Option<Response> {
        let _ = self.responses.send(Ok(String::from_utf8_lossy(message).to_string()));
        None
    }

    fn on_error(&self, condition: TransportCondition) {
        let _ = self.responses.send(Err(condition));
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let server_addr: SocketAddr = "127.0.0.1:9000".parse()?;
    let client_addr: SocketAddr = "127.0.0.1:9001".parse()?;

    let network = MemoryNetwork::new();
    let server = UdtTransport::new(TransportConfig::default(), network.bind(server_addr), Arc::new(PongServer))?;
    server.start_listening()?;

    let (responses_send, mut responses) = mpsc::unbounded_channel();
    let client = UdtTransport::new(TransportConfig::default(), network.bind(client_addr), Arc::new(PingClient { responses: responses_send }))?;

    for i in 0..args.num_pings {
        client.send(server_addr, format!("ping #{}", i).as_bytes(), Duration::from_millis(args.response_timeout_millis));
    }

    for _ in 0..args.num_pings {
        match responses.recv().await {
            Some(Ok(response)) => info!("client received {:?}", response),
            Some(Err(condition)) => warn!("ping failed: {}", condition),
            None => break,
        }
    }

    server.stop_listening();
    Ok(())
}
