mod radtunnel;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "radtunnel",
    version,
    about = "radtunnel - reverse tunnel with a SOCKS5 front-end"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses RADTUNNEL_CONFIG; then auto-detects radtunnel.toml > radtunnel.yaml > radtunnel.yml from CWD; then the OS default path (Linux: /etc/radtunnel/radtunnel.toml; others: user config dir). Built-in defaults apply when no file exists.
    #[arg(long, env = "RADTUNNEL_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    role: RoleCmd,
}

#[derive(Debug, Subcommand)]
enum RoleCmd {
    /// Public side: accept the tunnel and serve SOCKS5 through it.
    Mid {
        /// SOCKS5 listen address.
        #[arg(long)]
        socks_addr: Option<String>,
        /// Tunnel listen address.
        #[arg(long)]
        tunnel_addr: Option<String>,
        /// quic or tcp.
        #[arg(long)]
        transport: Option<String>,
    },
    /// Private side: dial mid-server and reach destinations on its behalf.
    Rad {
        /// mid-server address, `[quic://|tcp://]host[:port]`.
        #[arg(long)]
        server: Option<String>,
        /// quic or tcp; a scheme in --server wins.
        #[arg(long)]
        transport: Option<String>,
        /// Skip TLS certificate verification.
        #[arg(long)]
        insecure: bool,
    },
}

impl From<RoleCmd> for radtunnel::app::Role {
    fn from(cmd: RoleCmd) -> Self {
        match cmd {
            RoleCmd::Mid {
                socks_addr,
                tunnel_addr,
                transport,
            } => radtunnel::app::Role::Mid {
                socks_addr,
                tunnel_addr,
                transport,
            },
            RoleCmd::Rad {
                server,
                transport,
                insecure,
            } => radtunnel::app::Role::Rad {
                server,
                transport,
                insecure,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    radtunnel::run(cli.config, cli.role.into()).await
}
