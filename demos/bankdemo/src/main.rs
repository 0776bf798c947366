mod bank;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::{TcpListener, UnixListener};

use bank::{foo_service, Foo, SumArgs, SumReply};
use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::discovery::{Discovery, PullDiscovery, SelectMode, StaticDiscovery};
use gbankrpc_core::{GBankRegistry, Server, XClient};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "bankdemo", about = "Demo GBankRPC bank service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the Foo service on one transport.
    Serve(ServeArgs),
    /// Run the original demo end to end: two servers, a registry, direct
    /// calls and broadcasts, including an expected Sleep-broadcast timeout.
    Demo,
}

#[derive(ValueEnum, Clone, Copy)]
enum Network {
    Tcp,
    Unix,
    Http,
}

#[derive(Parser)]
struct ServeArgs {
    /// Address to listen on; a socket path when --network unix.
    #[arg(long, default_value = "127.0.0.1:0")]
    address: String,

    #[arg(long, value_enum, default_value_t = Network::Tcp)]
    network: Network,

    /// Registry URL to heartbeat against, e.g. http://127.0.0.1:6666/registry.
    #[arg(long)]
    registry: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve(args) => run_serve(args).await,
        Command::Demo => run_demo().await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new();
    server.register(foo_service(Foo::new()))?;

    let rpc_addr = match args.network {
        Network::Tcp => {
            let listener = TcpListener::bind(&args.address).await?;
            let local = listener.local_addr()?;
            tokio::spawn(async move { server.accept_tcp(listener).await });
            format!("tcp@{local}")
        }
        Network::Http => {
            let listener = TcpListener::bind(&args.address).await?;
            let local = listener.local_addr()?;
            tokio::spawn(async move { server.accept_http(listener).await });
            format!("http@{local}")
        }
        Network::Unix => {
            let listener = UnixListener::bind(&args.address)?;
            let path = args.address.clone();
            tokio::spawn(async move { server.accept_unix(listener).await });
            format!("unix@{path}")
        }
    };
    eprintln!("bankdemo listening on {rpc_addr}");

    if let Some(registry) = args.registry {
        gbankrpc_core::spawn_heartbeat(registry, rpc_addr, Duration::ZERO).await?;
    }

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down");
    Ok(())
}

async fn start_demo_server() -> Result<String, Box<dyn std::error::Error>> {
    let server = Server::new();
    server.register(foo_service(Foo::new()))?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { server.accept_tcp(listener).await });
    Ok(format!("tcp@{addr}"))
}

/// Mirrors the original demo's `testXClient`/`testRegistry`: two servers,
/// direct calls load-balanced across them, and a broadcast whose `Sleep`
/// round is expected to time out against the far half of the servers.
async fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let addr1 = start_demo_server().await?;
    let addr2 = start_demo_server().await?;
    eprintln!("started demo servers on {addr1} and {addr2}");

    let static_disc: Arc<dyn Discovery> =
        Arc::new(StaticDiscovery::new(vec![addr1.clone(), addr2.clone()]));
    demo_call_and_broadcast(&static_disc, "direct discovery").await;

    let registry = GBankRegistry::new(Duration::ZERO);
    let registry_listener = TcpListener::bind("127.0.0.1:0").await?;
    let registry_addr = registry_listener.local_addr()?;
    let registry_url = format!("http://{registry_addr}/gbankrpc/registry");
    tokio::spawn(Arc::clone(&registry).serve(registry_listener));
    eprintln!("started registry on {registry_addr}");

    gbankrpc_core::spawn_heartbeat(registry_url.clone(), addr1, Duration::ZERO).await?;
    gbankrpc_core::spawn_heartbeat(registry_url.clone(), addr2, Duration::ZERO).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pull_disc: Arc<dyn Discovery> = Arc::new(PullDiscovery::new(registry_url, Duration::ZERO));
    demo_call_and_broadcast(&pull_disc, "registry discovery").await;

    Ok(())
}

async fn demo_call_and_broadcast(discovery: &Arc<dyn Discovery>, label: &str) {
    let xc = XClient::new(Arc::clone(discovery), SelectMode::Random, HandshakeOption::default());

    for i in 0..5i64 {
        let args = SumArgs {
            num1: i,
            num2: i * i,
        };
        match xc.call::<SumArgs, SumReply>("Foo.Sum", &args).await {
            Ok(reply) => eprintln!("[{label}] call Foo.Sum: {} + {} = {}", args.num1, args.num2, reply.0),
            Err(e) => eprintln!("[{label}] call Foo.Sum error: {e}"),
        }
    }

    for i in 0..5i64 {
        let args = SumArgs {
            num1: i,
            num2: i * i,
        };
        match xc
            .broadcast::<SumArgs, SumReply>("Foo.Sum", &args, CancellationToken::new())
            .await
        {
            Ok(reply) => eprintln!("[{label}] broadcast Foo.Sum: {} + {} = {}", args.num1, args.num2, reply.0),
            Err(e) => eprintln!("[{label}] broadcast Foo.Sum error: {e}"),
        }

        // Sleep(2s) against every server, under a 1.5s caller deadline:
        // expected to cancel out every round.
        let sleep_args = SumArgs { num1: 2, num2: 0 };
        match xc
            .broadcast_timeout::<SumArgs, SumReply>("Foo.Sleep", &sleep_args, Duration::from_millis(1500))
            .await
        {
            Ok(reply) => {
                eprintln!("[{label}] broadcast Foo.Sleep: unexpectedly succeeded with {}", reply.0)
            }
            Err(e) => eprintln!("[{label}] broadcast Foo.Sleep canceled as expected: {e}"),
        }
    }

    let _ = xc.close().await;
}
