mod cli;

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::net::{TcpListener, UnixListener};

use cli::{CallArgs, Cli, Command, Network, RegistryArgs, ServeArgs};
use gbankrpc_core::codec::HandshakeOption;
use gbankrpc_core::service::ServiceBuilder;
use gbankrpc_core::{Client, GBankRegistry, Server};

struct Echo;

fn echo_service() -> gbankrpc_core::ServiceEntry {
    ServiceBuilder::new("Echo", Echo)
        .method("Call", |_h: Arc<Echo>, arg: serde_json::Value| async move {
            Ok::<_, String>(arg)
        })
        .build()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Call(args) => run_call(args).await,
        Command::Registry(args) => run_registry(args).await,
    };

    if let Err(e) = result {
        eprintln!("gbankrpc: {e}");
        process::exit(1);
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new();
    server.register(echo_service())?;

    let debug_table = server.service_table();

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
    println!("listening on {rpc_addr}");

    if let Some(debug_address) = args.debug_address {
        let listener = TcpListener::bind(&debug_address).await?;
        println!("debug page listening on {}", listener.local_addr()?);
        tokio::spawn(async move {
            gbankrpc_core::debug::serve_debug(listener, debug_table).await
        });
    }

    if let Some(registry) = args.registry {
        gbankrpc_core::spawn_heartbeat(registry, rpc_addr, args.heartbeat_interval()).await?;
    }

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down");
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<(), Box<dyn std::error::Error>> {
    let body = if args.data == "@" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        args.data.clone()
    };
    let arg: serde_json::Value = serde_json::from_str(&body)?;

    let opt = HandshakeOption {
        handle_timeout: args.handle_timeout(),
        ..HandshakeOption::default()
    };
    let client = match args.network {
        Network::Tcp => Client::dial("tcp", &args.address, opt).await?,
        Network::Unix => Client::dial("unix", &args.address, opt).await?,
        Network::Http => Client::dial_http("tcp", &args.address, opt).await?,
    };

    let reply: serde_json::Value = match args.timeout() {
        Some(timeout) => {
            client
                .call_timeout(args.service_method.as_str(), &arg, timeout)
                .await?
        }
        None => client.call(args.service_method.as_str(), &arg).await?,
    };

    println!("{}", serde_json::to_string_pretty(&reply)?);
    client.close().await?;
    Ok(())
}

async fn run_registry(args: RegistryArgs) -> Result<(), Box<dyn std::error::Error>> {
    let registry = GBankRegistry::new(args.timeout());
    let listener = TcpListener::bind(&args.address).await?;
    println!("registry listening on {}", listener.local_addr()?);

    tokio::select! {
        _ = registry.serve(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("shutting down");
        }
    }
    Ok(())
}
