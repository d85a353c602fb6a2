use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use chat_relay::cli::Args;
use chat_relay::client::{ChatClient, ExchangeState, Settlement};
use chat_relay::config::RelayConfig;
use chat_relay::encoder::Pacing;
use chat_relay::{web, ChatRelay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.serve {
        let config = RelayConfig::from_env();
        if config.base_url.is_none() {
            eprintln!(
                "{}",
                "warning: FLOWISE_BASE_URL is not set; requests will fail until it is".yellow()
            );
        }
        let mut relay = ChatRelay::new(config);
        if args.zero_delay {
            relay = relay.with_pacing(Pacing::None);
        }
        web::serve(&args.bind, args.port, relay).await?;
        return Ok(());
    }

    let Some(message) = args.message else {
        eprintln!("usage: chat-relay --serve | chat-relay \"<message>\"");
        std::process::exit(2);
    };

    println!("{} {}", "you:".bright_blue().bold(), message);
    print!("{} ", "assistant:".bright_green().bold());

    let mut client = ChatClient::new(args.relay_url).with_echo(true);
    let state = client.send(&message).await;
    println!();

    if state == ExchangeState::Settled(Settlement::Errored) {
        std::process::exit(1);
    }
    Ok(())
}
