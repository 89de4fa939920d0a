use clap::Parser;
use rtsp::{Hooks, Server, ServerConfig};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP relay: encoders publish on one port, players watch on the other"
)]
struct Args {
    /// Address to bind the RTSP listeners and RTP sockets to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// RTSP port for publishers (ANNOUNCE/RECORD)
    #[arg(long, default_value_t = 5554)]
    publisher_port: u16,

    /// RTSP port for players (DESCRIBE/PLAY)
    #[arg(long, default_value_t = 6554)]
    subscriber_port: u16,

    /// First port of the RTP/RTCP range (even)
    #[arg(long, default_value_t = 10000)]
    rtp_port_start: u16,

    /// Number of ports in the RTP/RTCP range (even)
    #[arg(long, default_value_t = 10000)]
    rtp_port_count: u16,

    /// Seconds without a keepalive before a player session is closed
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,

    /// Port pairs tried per bind before giving up
    #[arg(long, default_value_t = 10)]
    bind_attempts: u32,

    /// Require Basic credentials, as user:password (repeatable)
    #[arg(long = "user", short, value_parser = parse_user)]
    users: Vec<(String, String)>,
}

fn parse_user(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((user, pass)) if !user.is_empty() => Ok((user.to_string(), pass.to_string())),
        _ => Err(format!("expected user:password, got {value:?}")),
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = ServerConfig {
        bind_host: args.host,
        publisher_port: args.publisher_port,
        subscriber_port: args.subscriber_port,
        rtp_port_start: args.rtp_port_start,
        rtp_port_count: args.rtp_port_count,
        session_timeout: Duration::from_secs(args.session_timeout),
        bind_attempts: args.bind_attempts,
        ..ServerConfig::default()
    };

    let mut hooks = Hooks::new()
        .with_mount_now_empty(|mount| {
            tracing::info!(mount = %mount.path(), "no players left");
        })
        .with_client_close(|mount| {
            tracing::info!(mount = %mount.path(), "player session closed");
        });
    if !args.users.is_empty() {
        let users: HashMap<String, String> = args.users.into_iter().collect();
        tracing::info!(users = users.len(), "Basic authentication enabled");
        hooks = hooks.with_credentials(users);
    }

    let mut server = Server::with_hooks(config, hooks);

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    if let (Some(publisher), Some(subscriber)) = (server.publisher_addr(), server.subscriber_addr()) {
        println!("Publish to rtsp://{publisher}/<path>, play from rtsp://{subscriber}/<path>, press Enter to stop");
    }
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        eprintln!("Failed to read stdin: {}", e);
    }

    server.stop();
}
