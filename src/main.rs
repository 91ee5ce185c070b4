//! CLI for wsqueue
//!
//! Subcommands:
//! - `server`: run the WebSocket server with the configured queues and topics
//! - `listen`: consume a queue and print (then acknowledge) every message
//! - `subscribe`: print every message published on a topic

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use wsqueue::broker::{ConnectionObserver, NoopObserver};
use wsqueue::client::Client;
use wsqueue::client::consumer::Listener;
use wsqueue::config::load_config;
use wsqueue::transport::{Server, start_websocket_server};
use wsqueue::utils::logging;

#[derive(Parser)]
#[command(name = "wsqueue")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Consume messages from a queue, acknowledging each one
    Listen {
        /// Server URL including any route prefix
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        queue: String,
    },
    /// Print messages published on a topic
    Subscribe {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    logging::init("info");

    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
            }
        }
        Command::Listen { url, queue } => {
            let listener = Client::new(url).listen(&queue);
            print_messages(listener, true).await;
        }
        Command::Subscribe { url, topic } => {
            let listener = Client::new(url).subscribe(&topic);
            print_messages(listener, false).await;
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let addr = config.address();
    let server = Arc::new(Server::new(config.server.route_prefix.clone()));
    let observer: Arc<dyn ConnectionObserver> = Arc::new(NoopObserver);

    for queue in &config.queues {
        let options = config.broker.queue_options(queue.acl.clone())?;
        server.create_queue(&queue.name, options, observer.clone())?;
    }
    for topic in &config.topics {
        server.create_topic(&topic.name, topic.options(), observer.clone());
    }

    tokio::select! {
        result = start_websocket_server(&addr, server.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server exited unexpectedly: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    server.shutdown().await;
    Ok(())
}

async fn print_messages(mut listener: Listener, ack: bool) {
    while let Some(result) = listener.recv().await {
        match result {
            Ok(message) => {
                println!("{message}");
                if ack {
                    if let Err(e) = listener.ack(&message) {
                        warn!("Failed to acknowledge {}: {e}", message.id());
                    }
                }
            }
            Err(e) => error!("{e}"),
        }
    }
}
