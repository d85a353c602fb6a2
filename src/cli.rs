use clap::Parser;

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(version = "0.3.0")]
#[command(about = "Relay a single-shot chat backend to browsers as an incremental frame stream")]
pub struct Args {
    /// Message to send through a running relay (client mode)
    pub message: Option<String>,

    /// Run the relay HTTP server instead of sending a message
    #[arg(long)]
    pub serve: bool,

    /// Port for the relay server
    #[arg(long, default_value = "8787")]
    pub port: u16,

    /// Address the relay server binds on
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Relay endpoint for client mode
    #[arg(long, default_value = "http://127.0.0.1:8787/api/chat")]
    pub relay_url: String,

    /// Disable inter-frame pacing delays
    #[arg(long)]
    pub zero_delay: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_client_mode() {
        let args = Args::parse_from(["chat-relay", "hola"]);
        assert_eq!(args.message.as_deref(), Some("hola"));
        assert!(!args.serve);
        assert_eq!(args.port, 8787);
        assert_eq!(args.bind, "127.0.0.1");
        assert_eq!(args.relay_url, "http://127.0.0.1:8787/api/chat");
        assert!(!args.zero_delay);
    }

    #[test]
    fn test_args_parse_serve_mode() {
        let args = Args::parse_from(["chat-relay", "--serve", "--port", "9000"]);
        assert!(args.serve);
        assert_eq!(args.port, 9000);
        assert!(args.message.is_none());
    }

    #[test]
    fn test_args_parse_custom_bind() {
        let args = Args::parse_from(["chat-relay", "--serve", "--bind", "0.0.0.0"]);
        assert_eq!(args.bind, "0.0.0.0");
    }

    #[test]
    fn test_args_parse_relay_url_override() {
        let args = Args::parse_from([
            "chat-relay",
            "hi",
            "--relay-url",
            "http://relay.internal/api/chat",
        ]);
        assert_eq!(args.relay_url, "http://relay.internal/api/chat");
    }

    #[test]
    fn test_args_parse_zero_delay() {
        let args = Args::parse_from(["chat-relay", "--serve", "--zero-delay"]);
        assert!(args.zero_delay);
    }
}
