use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;

use es_tools::client::commands;
use es_tools::client::context::{ClientContext, CommandOutcome, is_connection_loss};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "es",
    version,
    about = "Easyshare client - discover servers, browse sharings, transfer files",
    long_about = "`es` talks to `esd` servers on the local network. Run it with a command \
(e.g. `es scan`, `es open music`) or without arguments for an interactive session. See \
`help` inside the interactive session for the command list."
)]
struct Args {
    /// Command and its arguments; interactive mode when omitted
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    command: Vec<String>,

    /// Discovery port probed on servers
    #[arg(
        short = 'd',
        long = "discover-port",
        value_name = "PORT",
        default_value_t = remote::protocol::DEFAULT_DISCOVER_PORT
    )]
    discover_port: u16,

    /// How long to wait for discovery replies
    #[arg(
        short = 'w',
        long = "discover-wait",
        value_name = "DURATION",
        default_value = "2s"
    )]
    discover_wait: String,

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

async fn interactive(context: &mut ClientContext) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"es> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        match commands::execute(context, &tokens).await {
            Ok(CommandOutcome::Quit) => return Ok(()),
            Ok(CommandOutcome::Continue) => {}
            Err(error) => {
                eprintln!("es: {error:#}");
                if is_connection_loss(&error) {
                    return Err(error);
                }
            }
        }
    }
}

async fn async_main(args: Args, wait: std::time::Duration) -> anyhow::Result<()> {
    let mut context = ClientContext::new(args.discover_port, wait);
    if args.command.is_empty() {
        return interactive(&mut context).await;
    }
    commands::execute(&mut context, &args.command).await?;
    // a one-shot `open`/`connect` flows into the interactive session, the
    // way the transfer commands expect to be driven afterwards
    if context.connection.is_some() {
        return interactive(&mut context).await;
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let output = common::OutputConfig {
        verbose: args.verbose,
        trace: args.trace,
        no_color: args.no_color,
    };
    let wait = match humantime::parse_duration(&args.discover_wait) {
        Ok(wait) => wait,
        Err(error) => {
            eprintln!("es: invalid --discover-wait: {error}");
            std::process::exit(2);
        }
    };
    if common::run(&output, || async_main(args, wait)).is_none() {
        std::process::exit(1);
    }
}
