#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vaws
//!
//! Tunnels from an operator's machine into private AWS resources.
//!
//! ## Subcommands
//!
//! - `vaws forward` — SSM port forwarder to an ECS container
//! - `vaws gateway public` — local proxy in front of a public API Gateway stage
//! - `vaws gateway private` — local proxy to a VPC-private stage through a bastion
//! - `vaws list` — persisted TCP tunnels (surviving forwarders are adopted)
//! - `vaws stop <id>` / `vaws stop-all` — kill forwarders
//! - `vaws restart <id>` — start a stopped TCP tunnel again
//! - `vaws clear` — drop terminated entries
//!
//! `forward`, `gateway` and `restart` stay in the foreground until SIGINT or
//! SIGTERM, then stop the tunnels they started.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, signal handling
//! config.rs        — TOML + env-var configuration
//! supervisor.rs    — process-group spawn, output capture, group kill
//! ports.rs         — loopback port allocation, shared port claims
//! ssm.rs           — `ssm start-session` argv
//! resources.rs     — ECS target, gateway, stage, bastion, VPC endpoint
//! tunnel/
//!   mod.rs         — TcpTunnelManager (start, monitor, stop, adopt, restart)
//!   store.rs       — tunnels.json background writer
//! gateway/
//!   mod.rs         — GatewayTunnelManager (public/private, host resolution)
//!   proxy.rs       — reverse proxy (SNI, Host, stage prefix, 502)
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vaws::resources::{Bastion, EndpointType, ForwardTarget, GatewayApi, Stage, VpcEndpoint};
use vaws::{
    Config, GatewayTunnel, GatewayTunnelManager, PortClaims, TcpTunnel, TcpTunnelManager,
    TunnelError, TunnelStore,
};

/// Tunnels into private AWS resources.
#[derive(Parser)]
#[command(name = "vaws", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a local port to a port inside an ECS container.
    Forward {
        /// Service the task belongs to.
        #[arg(long)]
        service: String,
        /// Cluster ARN or name.
        #[arg(long)]
        cluster: String,
        /// Task ARN or id.
        #[arg(long)]
        task: String,
        #[arg(long)]
        container: String,
        /// Container runtime id.
        #[arg(long)]
        runtime_id: String,
        /// Port inside the container.
        #[arg(long)]
        remote_port: u16,
        /// Local port (0 picks a free one).
        #[arg(long, default_value_t = 0)]
        local_port: u16,
    },
    /// Serve an API Gateway stage on localhost.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommands,
    },
    /// List TCP tunnels.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Stop a TCP tunnel.
    Stop { id: String },
    /// Stop every TCP tunnel.
    StopAll,
    /// Start a stopped TCP tunnel again with the same parameters.
    Restart { id: String },
    /// Remove terminated and failed TCP tunnels.
    Clear,
}

#[derive(Subcommand)]
enum GatewayCommands {
    /// Proxy to the stage's public invoke URL.
    Public {
        #[command(flatten)]
        api: ApiArgs,
        #[arg(long, default_value_t = 0)]
        local_port: u16,
    },
    /// Proxy to a private stage through a bastion.
    Private {
        #[command(flatten)]
        api: ApiArgs,
        /// Bastion instance id.
        #[arg(long)]
        bastion: String,
        /// VPC endpoint id to build the gateway hostname from.
        #[arg(long)]
        vpc_endpoint: Option<String>,
        /// Id of a discovered execute-api VPC endpoint.
        #[arg(long, requires = "endpoint_dns")]
        discovered_endpoint: Option<String>,
        /// DNS names of the discovered endpoint, most specific first.
        #[arg(long)]
        endpoint_dns: Vec<String>,
        #[arg(long, default_value_t = 0)]
        local_port: u16,
    },
}

#[derive(clap::Args)]
struct ApiArgs {
    #[arg(long)]
    api_id: String,
    #[arg(long, default_value = "")]
    api_name: String,
    /// `rest` (v1) or `http` (v2).
    #[arg(long, default_value = "rest")]
    kind: String,
    /// REST endpoint type: REGIONAL, EDGE or PRIVATE.
    #[arg(long, default_value = "REGIONAL")]
    endpoint_type: EndpointType,
    /// VPC endpoint ids attached to the API (repeatable).
    #[arg(long = "api-vpc-endpoint")]
    vpc_endpoint_ids: Vec<String>,
    #[arg(long)]
    stage: String,
    /// Stage invoke URL.
    #[arg(long)]
    invoke_url: String,
}

impl ApiArgs {
    fn descriptors(&self) -> Result<(GatewayApi, Stage), TunnelError> {
        let name = if self.api_name.is_empty() {
            &self.api_id
        } else {
            &self.api_name
        };
        let api = GatewayApi::from_parts(
            &self.kind,
            &self.api_id,
            name,
            self.endpoint_type,
            self.vpc_endpoint_ids.clone(),
        )?;
        let stage = Stage {
            name: self.stage.clone(),
            invoke_url: self.invoke_url.clone(),
        };
        Ok((api, stage))
    }
}

/// Both managers sharing one port-claim registry.
struct Console {
    tcp: TcpTunnelManager,
    gateway: GatewayTunnelManager,
}

impl Console {
    async fn open(config: &Config) -> Self {
        let ports = PortClaims::new();
        let store = TunnelStore::open(&config.tunnels.state_path());
        let tcp = TcpTunnelManager::new(
            config.aws.clone(),
            config.tunnels.output_limit,
            store,
            ports.clone(),
        );
        tcp.recover().await;
        let gateway = GatewayTunnelManager::new(config.aws.clone(), config.tunnels.clone(), ports);
        Self { tcp, gateway }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("vaws: {e}");
            return ExitCode::from(2);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vaws: {e} ({})", e.code());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &Config) -> Result<(), TunnelError> {
    let console = Console::open(config).await;
    let result = dispatch(&console, command).await;
    // Failed starts are recorded too; make sure they reach disk.
    console.tcp.flush().await;
    result
}

async fn dispatch(console: &Console, command: Commands) -> Result<(), TunnelError> {
    match command {
        Commands::Forward {
            service,
            cluster,
            task,
            container,
            runtime_id,
            remote_port,
            local_port,
        } => {
            let target = ForwardTarget {
                service_name: service,
                cluster_arn: cluster,
                task_id: task,
                container_name: container,
                runtime_id,
            };
            let tunnel = console.tcp.start(&target, remote_port, local_port).await?;
            print_tcp_started(&tunnel);
            hold(console, &[tunnel.id]).await;
            Ok(())
        }
        Commands::Restart { id } => {
            let spec = console.tcp.prepare_restart(&id).await?;
            let tunnel = console
                .tcp
                .start(&spec.target, spec.remote_port, spec.local_port)
                .await?;
            print_tcp_started(&tunnel);
            hold(console, &[tunnel.id]).await;
            Ok(())
        }
        Commands::Gateway { command } => run_gateway(console, command).await,
        Commands::List { json } => {
            let tunnels = console.tcp.get_tunnels().await;
            if json {
                let out = serde_json::to_string_pretty(&tunnels).map_err(std::io::Error::other)?;
                println!("{out}");
            } else {
                print_tcp_table(&tunnels);
            }
            Ok(())
        }
        Commands::Stop { id } => console.tcp.stop(&id).await,
        Commands::StopAll => {
            let stopped = console.tcp.stop_all().await;
            println!("stopped {stopped} tunnel(s)");
            Ok(())
        }
        Commands::Clear => {
            let removed = console.tcp.clear_terminated().await;
            println!("removed {removed} tunnel(s)");
            Ok(())
        }
    }
}

async fn run_gateway(console: &Console, command: GatewayCommands) -> Result<(), TunnelError> {
    let tunnel = match command {
        GatewayCommands::Public { api, local_port } => {
            let (api, stage) = api.descriptors()?;
            console
                .gateway
                .start_public_tunnel(&api, &stage, local_port)
                .await?
        }
        GatewayCommands::Private {
            api,
            bastion,
            vpc_endpoint,
            discovered_endpoint,
            endpoint_dns,
            local_port,
        } => {
            let (api, stage) = api.descriptors()?;
            let bastion = Bastion {
                instance_id: bastion,
                name: None,
            };
            let discovered = discovered_endpoint.map(|id| VpcEndpoint {
                id,
                dns_entries: endpoint_dns,
            });
            console
                .gateway
                .start_private_tunnel(
                    &api,
                    &stage,
                    &bastion,
                    discovered.as_ref(),
                    vpc_endpoint.as_deref(),
                    local_port,
                )
                .await?
        }
    };
    print_gateway_started(&tunnel);
    hold(console, &[]).await;
    Ok(())
}

/// Stay in the foreground until a signal arrives or every tunnel this run
/// started has gone down, then stop them.
async fn hold(console: &Console, tcp_ids: &[String]) {
    tokio::select! {
        () = shutdown_signal() => {}
        () = all_down(console, tcp_ids) => warn!("all tunnels are down"),
    }

    info!("Shutting down...");
    for id in tcp_ids {
        if let Err(e) = console.tcp.stop(id).await {
            warn!(tunnel_id = %id, "stop failed: {e}");
        }
    }
    console.gateway.stop_all_tunnels().await;
    for tunnel in console.gateway.get_tunnels().await {
        if let Some(error) = tunnel.error {
            eprintln!("{}: {error}", tunnel.id);
        }
    }
    for id in tcp_ids {
        if let Some(TcpTunnel {
            error: Some(error), ..
        }) = console.tcp.get_tunnel(id).await
        {
            eprintln!("{id}: {error}");
        }
    }
}

async fn all_down(console: &Console, tcp_ids: &[String]) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let mut live = console.gateway.active_count().await;
        for id in tcp_ids {
            if console
                .tcp
                .get_tunnel(id)
                .await
                .is_some_and(|t| t.status.is_live())
            {
                live += 1;
            }
        }
        if live == 0 {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
                return;
            }
        };
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

fn print_tcp_started(tunnel: &TcpTunnel) {
    println!(
        "{}: 127.0.0.1:{} -> {}/{}:{} (pid {})",
        tunnel.id,
        tunnel.local_port,
        tunnel.target.service_name,
        tunnel.target.container_name,
        tunnel.remote_port,
        tunnel.pid
    );
}

fn print_gateway_started(tunnel: &GatewayTunnel) {
    let upstream = tunnel
        .remote_host
        .as_deref()
        .map_or_else(|| tunnel.invoke_url.clone(), |host| format!("https://{host}"));
    println!(
        "{}: http://localhost:{} -> {} ({} {}, stage {})",
        tunnel.id, tunnel.local_port, upstream, tunnel.api_kind, tunnel.api_name, tunnel.stage_name
    );
}

fn print_tcp_table(tunnels: &[TcpTunnel]) {
    if tunnels.is_empty() {
        println!("no tunnels");
        return;
    }
    println!(
        "{:<36} {:<10} {:>6} {:>7} {:<30} {}",
        "ID", "STATUS", "LOCAL", "PID", "TARGET", "STARTED"
    );
    for t in tunnels {
        let target = format!(
            "{}/{}:{}",
            t.target.cluster_name(),
            t.target.container_name,
            t.remote_port
        );
        println!(
            "{:<36} {:<10} {:>6} {:>7} {:<30} {}",
            t.id,
            t.status,
            t.local_port,
            t.pid,
            target,
            t.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &t.error {
            println!("    error: {error}");
        }
    }
}
