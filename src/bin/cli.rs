// Group call server CLI
// Checks a running server over HTTP and talks to it over the signaling WebSocket

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::*;
use futures::{future, SinkExt, StreamExt};
use groupcall_sfu::rpc::{Responder, RpcChannel, RpcHandler};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "groupcall-cli")]
#[command(about = "Group call server CLI", long_about = None)]
struct Cli {
    /// Server address (default: 127.0.0.1:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health endpoint
    Health,

    /// Fetch the router RTP capabilities
    Capabilities,

    /// Join the call without media
    Join {
        /// Display name shown to other peers
        #[arg(short, long, default_value = "cli")]
        name: String,

        /// Stay connected and print notifications (press Ctrl+C to exit)
        #[arg(short, long)]
        watch: bool,
    },

    /// List the peers currently in the call
    Roster,

    /// Interactive mode - send custom requests
    Interactive,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => check_health(&cli.server).await,
        Commands::Capabilities => show_capabilities(&cli.server).await,
        Commands::Join { name, watch } => join(&cli.server, name, *watch).await,
        Commands::Roster => show_roster(&cli.server).await,
        Commands::Interactive => interactive_mode(&cli.server).await,
    }
}

/// Forwards everything the server pushes to the session's queue and turns
/// down server-initiated requests.
struct CliHandler {
    notifications: mpsc::UnboundedSender<(String, Value)>,
}

#[async_trait]
impl RpcHandler for CliHandler {
    async fn on_request(&self, method: String, _data: Value, responder: Responder) {
        responder.reject(format!("cli does not handle {method}"));
    }

    async fn on_notification(&self, method: String, data: Value) {
        let _ = self.notifications.send((method, data));
    }

    async fn on_close(&self) {}
}

/// One signaling connection driven by an [`RpcChannel`].
struct Session {
    channel: RpcChannel,
    notifications: mpsc::UnboundedReceiver<(String, Value)>,
    sender_task: JoinHandle<()>,
}

impl Session {
    async fn open(server: &str) -> Option<Self> {
        let url = format!("ws://{}/", server);
        let ws_stream = match connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                println!("{} Cannot connect to server: {}", "✗".red(), e);
                println!("  Make sure the server is running on {}", server);
                return None;
            }
        };
        println!("{} Connected to {}", "✓".green(), url);

        let (mut write, read) = ws_stream.split();
        let (channel, mut outbound) = RpcChannel::new();

        let sender_task = tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let incoming = read
            .take_while(|result| future::ready(matches!(result, Ok(message) if !message.is_close())))
            .filter_map(|result| {
                future::ready(match result {
                    Ok(Message::Text(text)) => Some(text),
                    _ => None,
                })
            });

        let (tx, notifications) = mpsc::unbounded_channel();
        let reader = channel.clone();
        tokio::spawn(async move {
            reader.run(incoming, Arc::new(CliHandler { notifications: tx })).await;
        });

        Some(Self {
            channel,
            notifications,
            sender_task,
        })
    }

    async fn request(&self, method: &str, data: Value) -> Result<Value, String> {
        match timeout(RESPONSE_TIMEOUT, self.channel.request(method, data)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("timeout waiting for response".to_string()),
        }
    }

    async fn next_notification(&mut self) -> Option<(String, Value)> {
        self.notifications.recv().await
    }

    /// Waits for the notification named `method`, printing any others.
    async fn wait_for(&mut self, method: &str) -> Option<Value> {
        loop {
            match timeout(RESPONSE_TIMEOUT, self.next_notification()).await {
                Ok(Some((name, data))) if name == method => return Some(data),
                Ok(Some((name, data))) => print_notification(&name, &data),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    async fn join(&self, name: &str) -> Result<(), String> {
        let capabilities = self.request("getRouterRtpCapabilities", json!({})).await?;
        self.request(
            "join",
            json!({ "rtpCapabilities": capabilities, "displayName": name }),
        )
        .await
        .map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sender_task.abort();
    }
}

fn print_notification(method: &str, data: &Value) {
    match method {
        "peerJoined" => println!(
            "{} {} joined ({})",
            "◀".green(),
            data["displayName"].as_str().unwrap_or("unknown").bold(),
            data["id"].as_str().unwrap_or("?")
        ),
        "peerLeft" => println!(
            "{} {} left",
            "◀".yellow(),
            data["id"].as_str().unwrap_or("?")
        ),
        _ => println!("{} {} {}", "◀".green(), method.cyan(), data.to_string().bright_white()),
    }
}

fn print_roster(data: &Value) {
    let peers = data["otherPeerDetails"].as_array().cloned().unwrap_or_default();
    if peers.is_empty() {
        println!("  {}", "No other peers in the call".yellow());
        return;
    }

    println!("\n{}", "═".repeat(50).green());
    for peer in &peers {
        println!(
            "  {} {}",
            peer["displayName"].as_str().unwrap_or("unknown").bold(),
            peer["id"].as_str().unwrap_or("?").dimmed()
        );
    }
    println!("{}", "═".repeat(50).green());
    println!("  {} peer(s)", peers.len());
}

async fn check_health(server: &str) {
    println!("{}", "Checking server health...".cyan());

    let url = format!("http://{}/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                    println!("  Peers: {}", body["peers"]);
                    println!(
                        "  Recording: {}",
                        body["recording"]["status"].as_str().unwrap_or("unknown")
                    );
                    if let Some(peer_id) = body["recording"]["peerId"].as_str() {
                        println!("  Recording peer: {}", peer_id);
                    }
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            println!("  Make sure the server is running on {}", server);
        }
    }
}

async fn show_capabilities(server: &str) {
    println!("{}", "Fetching router capabilities...".cyan());

    let Some(session) = Session::open(server).await else {
        return;
    };

    match session.request("getRouterRtpCapabilities", json!({})).await {
        Ok(capabilities) => {
            let codecs = capabilities["codecs"].as_array().cloned().unwrap_or_default();
            println!("{} {} codec(s)", "✓".green(), codecs.len());
            for codec in &codecs {
                println!(
                    "  {} {} Hz",
                    codec["mimeType"].as_str().unwrap_or("unknown").bold(),
                    codec["clockRate"]
                );
            }
        }
        Err(e) => println!("{} Request failed: {}", "✗".red(), e),
    }
}

async fn join(server: &str, name: &str, watch: bool) {
    println!("{}", "Joining call...".cyan());
    println!("  Name: {}", name);

    let Some(mut session) = Session::open(server).await else {
        return;
    };

    if let Err(e) = session.join(name).await {
        println!("{} Join failed: {}", "✗".red(), e);
        return;
    }
    println!("{} Joined", "✓".green());

    match session.wait_for("setAvailablePeers").await {
        Some(data) => print_roster(&data),
        None => println!("{} No roster received", "✗".yellow()),
    }

    if !watch {
        return;
    }

    println!("\n{}", "Watching the call...".yellow());
    println!("Press {} to leave.", "Ctrl+C".bold());

    loop {
        tokio::select! {
            notification = session.next_notification() => match notification {
                Some((method, data)) => print_notification(&method, &data),
                None => {
                    println!("{} Server closed the connection", "✗".yellow());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nLeaving");
                break;
            }
        }
    }
}

async fn show_roster(server: &str) {
    println!("{}", "Fetching roster...".cyan());

    let Some(mut session) = Session::open(server).await else {
        return;
    };

    if let Err(e) = session.join("groupcall-cli").await {
        println!("{} Join failed: {}", "✗".red(), e);
        return;
    }

    match session.wait_for("setAvailablePeers").await {
        Some(data) => print_roster(&data),
        None => println!("{} No roster received", "✗".red()),
    }
}

async fn interactive_mode(server: &str) {
    println!("\n{}", "Interactive Mode".bold().green());
    println!("{}", "═".repeat(60).green());
    println!("Type {} for help, {} to quit\n", "help".cyan(), "quit".cyan());

    let Some(mut session) = Session::open(server).await else {
        return;
    };

    loop {
        while let Ok((method, data)) = session.notifications.try_recv() {
            print_notification(&method, &data);
        }

        print!("{} ", "►".cyan());
        if io::stdout().flush().is_err() {
            break;
        }

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            break;
        }

        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        if input == "quit" || input == "exit" {
            println!("Goodbye!");
            break;
        }

        if input == "help" {
            print_interactive_help();
            continue;
        }

        let (method, raw_data) = input.split_once(' ').unwrap_or((input, "{}"));
        let data = match serde_json::from_str::<Value>(raw_data) {
            Ok(data) => data,
            Err(_) => {
                println!("{} Invalid JSON. Type 'help' for examples.", "✗".yellow());
                continue;
            }
        };

        match session.request(method, data).await {
            Ok(data) => println!(
                "{} {}",
                "✓".green(),
                serde_json::to_string_pretty(&data).unwrap_or_default()
            ),
            Err(e) => println!("{} {}", "✗".red(), e),
        }
    }
}

fn print_interactive_help() {
    println!("\n{}", "Send a request as: <method> [json data]".bold());
    println!("\n{}", "Examples:".bold());
    println!("  getRouterRtpCapabilities");
    println!("  join {{\"rtpCapabilities\":{{\"codecs\":[]}},\"displayName\":\"ada\"}}");
    println!("  createProducerTransport");
    println!("  consume {{\"peerId\":\"<peer id>\"}}");
    println!();
}
