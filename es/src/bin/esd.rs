use clap::Parser;

use es_tools::server::config::{CliOverrides, ServerConfig};
use es_tools::server::daemon::Server;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "esd",
    version,
    about = "Easyshare server daemon - exposes named sharings on this host",
    long_about = "`esd` exposes one or more directories or files (\"sharings\") to `es` clients \
on the local network. Clients discover servers via UDP broadcast, authenticate when a password \
is configured, browse the sharing and transfer files in either direction."
)]
struct Args {
    /// Sharing to expose (defaults to the basename as the sharing name)
    #[arg(value_name = "PATH")]
    path: Option<std::path::PathBuf>,

    /// Name for the positional sharing
    #[arg(value_name = "SHARING_NAME")]
    sharing_name: Option<String>,

    /// Address to bind the control channel on
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Discovery port (0 disables discovery)
    #[arg(short = 'd', long = "discover-port", value_name = "PORT")]
    discover_port: Option<u16>,

    /// Enable remote command execution (rexec/rshell)
    #[arg(short = 'e', long)]
    rexec: bool,

    /// Server name announced to clients (default: host name)
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// Server password, plain or salted-hash form
    #[arg(short = 'P', long, value_name = "PASSWORD")]
    password: Option<String>,

    /// Control channel port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// PEM certificate enabling TLS
    #[arg(long = "ssl-cert", value_name = "FILE", help_heading = "TLS")]
    ssl_cert: Option<std::path::PathBuf>,

    /// PEM private key enabling TLS
    #[arg(long = "ssl-privkey", value_name = "FILE", help_heading = "TLS")]
    ssl_privkey: Option<std::path::PathBuf>,

    /// Log at TRACE level
    #[arg(short = 't', long, help_heading = "Output")]
    trace: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Disable ANSI colours in log output
    #[arg(long = "no-color", help_heading = "Output")]
    no_color: bool,
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let file = match &args.config {
        Some(path) => common::cfgfile::FileConfig::load(path)?,
        None => common::cfgfile::FileConfig::default(),
    };
    let cli = CliOverrides {
        address: args.address,
        port: args.port,
        discover_port: args.discover_port,
        name: args.name,
        password: args.password,
        rexec: args.rexec,
        ssl_cert: args.ssl_cert,
        ssl_privkey: args.ssl_privkey,
        sharing: args.path.map(|path| (path, args.sharing_name)),
    };
    let config = ServerConfig::from_sources(cli, file)?;
    let server = Server::bind(config).await?;
    let descriptor = server.descriptor();
    tracing::info!(
        "serving {} sharing(s) as {:?}",
        descriptor.sharings.len(),
        descriptor.name
    );
    server.run().await
}

fn main() {
    let args = Args::parse();
    let file_output = args
        .config
        .as_deref()
        .and_then(|path| common::cfgfile::FileConfig::load(path).ok());
    let output = common::OutputConfig {
        verbose: if args.verbose == 0
            && file_output.as_ref().is_some_and(|file| file.verbose == Some(true))
        {
            1
        } else {
            args.verbose
        },
        trace: args.trace
            || file_output
                .as_ref()
                .is_some_and(|file| file.trace == Some(true)),
        no_color: args.no_color
            || file_output
                .as_ref()
                .is_some_and(|file| file.no_color == Some(true)),
    };
    if common::run(&output, || async_main(args)).is_none() {
        std::process::exit(1);
    }
}
