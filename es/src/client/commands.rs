//! Interactive/one-shot command dispatch.

use common::list::{EntryInfo, EntryKind, FindFlags, LsFlags};
use remote::protocol::{BatchOutcome, OverwritePolicy, Pong, Request};

use crate::client::connection::Connection;
use crate::client::context::{ClientContext, CommandOutcome};
use crate::client::{rexec, transfer};

/// Executes one tokenized command line.
pub async fn execute(
    context: &mut ClientContext,
    tokens: &[String],
) -> anyhow::Result<CommandOutcome> {
    let Some((command, args)) = tokens.split_first() else {
        return Ok(CommandOutcome::Continue);
    };
    match command.as_str() {
        "exit" | "quit" => return Ok(CommandOutcome::Quit),
        "help" => print_help(),
        "scan" => scan(context).await?,
        "connect" => connect(context, args).await?,
        "open" => {
            let name = one_arg(args, "open NAME")?;
            context.open_sharing(name).await?;
            println!("opened {name}");
        }
        "close" => {
            context.call(&Request::Close).await?;
        }
        "ping" => {
            let pong: Pong = context
                .call_as(&Request::Ping {
                    payload: "ping".to_string(),
                })
                .await?;
            println!("pong at {}", pong.timestamp);
        }
        "info" => {
            let connection = context.connected()?;
            print_descriptor(connection);
        }
        "list" => {
            let sharings: Vec<remote::protocol::SharingDescriptor> =
                context.call_as(&Request::List).await?;
            for sharing in sharings {
                println!(
                    "{} ({:?}{})",
                    sharing.name,
                    sharing.kind,
                    if sharing.read_only { ", read-only" } else { "" }
                );
            }
        }
        "auth" => {
            let password = one_arg(args, "auth PASSWORD")?;
            context
                .call(&Request::Auth {
                    password: password.to_string(),
                })
                .await?;
            println!("authenticated");
        }
        "rpwd" => {
            let cwd: String = context.call_as(&Request::Rpwd).await?;
            println!("{cwd}");
        }
        "rcd" => {
            // no argument returns to the sharing root
            let path = args.first().cloned().unwrap_or_else(|| "/".to_string());
            let cwd: String = context.call_as(&Request::Rcd { path }).await?;
            println!("{cwd}");
        }
        "rls" => {
            let (flags, rest) = parse_ls_flags(args);
            let path = rest.first().cloned().unwrap_or_default();
            let entries: Vec<EntryInfo> =
                context.call_as(&Request::Rls { path, flags }).await?;
            print_entries(&entries);
        }
        "rtree" => {
            let (flags, rest) = parse_ls_flags(args);
            let path = rest.first().cloned().unwrap_or_default();
            let entries: Vec<EntryInfo> = context
                .call_as(&Request::Rtree {
                    path,
                    max_depth: None,
                    flags,
                })
                .await?;
            for entry in &entries {
                let depth = entry.depth.unwrap_or(0) as usize;
                println!("{}{}", "  ".repeat(depth), entry.name);
            }
        }
        "rmkdir" => {
            let path = one_arg(args, "rmkdir PATH")?;
            context
                .call(&Request::Rmkdir {
                    path: path.to_string(),
                })
                .await?;
        }
        "rmv" | "rcp" => {
            let Some((dest, sources)) = args.split_last().filter(|(_, rest)| !rest.is_empty())
            else {
                anyhow::bail!("usage: {command} SOURCE... DEST");
            };
            let request = if command == "rmv" {
                Request::Rmv {
                    sources: sources.to_vec(),
                    dest: dest.clone(),
                }
            } else {
                Request::Rcp {
                    sources: sources.to_vec(),
                    dest: dest.clone(),
                }
            };
            let outcomes: Vec<BatchOutcome> = context.call_as(&request).await?;
            print_outcomes(&outcomes);
        }
        "rrm" => {
            if args.is_empty() {
                anyhow::bail!("usage: rrm PATH...");
            }
            let outcomes: Vec<BatchOutcome> = context
                .call_as(&Request::Rrm {
                    paths: args.to_vec(),
                })
                .await?;
            print_outcomes(&outcomes);
        }
        "rfind" => {
            let pattern = one_arg(args, "rfind PATTERN")?;
            let entries: Vec<EntryInfo> = context
                .call_as(&Request::Rfind {
                    pattern: pattern.to_string(),
                    flags: FindFlags::default(),
                })
                .await?;
            for entry in &entries {
                println!("{}", entry.name);
            }
        }
        "get" => {
            let (policy, paths) = parse_policy(args, context.policy);
            let show_progress = context.show_progress;
            let connection = context.connected()?;
            let dest = std::env::current_dir()?;
            let (ours, _theirs) =
                transfer::get(connection, &paths, policy, &dest, show_progress).await?;
            println!("{}", transfer::summarize(&ours));
        }
        "put" => {
            if args.is_empty() {
                anyhow::bail!("usage: put [-y|-n|--newer|--different-size] LOCAL_PATH...");
            }
            let (policy, paths) = parse_policy(args, context.policy);
            let local_paths: Vec<std::path::PathBuf> =
                paths.iter().map(std::path::PathBuf::from).collect();
            let show_progress = context.show_progress;
            let connection = context.connected()?;
            let summary =
                transfer::put(connection, &local_paths, policy, show_progress).await?;
            println!("{}", transfer::summarize(&summary));
        }
        "rexec" => {
            if args.is_empty() {
                anyhow::bail!("usage: rexec COMMAND...");
            }
            let connection = context.connected()?;
            let code = rexec::run(connection, Some(args.join(" "))).await?;
            if code != 0 {
                println!("exit code: {code}");
            }
        }
        "rshell" => {
            let connection = context.connected()?;
            let code = rexec::run(connection, None).await?;
            if code != 0 {
                println!("exit code: {code}");
            }
        }
        other => anyhow::bail!("unknown command {other:?} (try `help`)"),
    }
    Ok(CommandOutcome::Continue)
}

fn one_arg<'a>(args: &'a [String], usage: &str) -> anyhow::Result<&'a str> {
    match args {
        [single] => Ok(single.as_str()),
        _ => anyhow::bail!("usage: {usage}"),
    }
}

fn parse_ls_flags(args: &[String]) -> (LsFlags, Vec<String>) {
    let mut flags = LsFlags::default();
    let mut rest = vec![];
    for arg in args {
        match arg.as_str() {
            "-g" | "--group-dirs" => flags.dirs_first = true,
            "-r" | "--reverse" => flags.reverse = true,
            "-S" | "--sort-size" => flags.sort_size = true,
            _ => rest.push(arg.clone()),
        }
    }
    (flags, rest)
}

fn parse_policy(args: &[String], default: OverwritePolicy) -> (OverwritePolicy, Vec<String>) {
    let mut policy = default;
    let mut rest = vec![];
    for arg in args {
        match arg.as_str() {
            "-y" | "--yes" => policy = OverwritePolicy::Yes,
            "-n" | "--no" => policy = OverwritePolicy::No,
            "--newer" => policy = OverwritePolicy::Newer,
            "--different-size" => policy = OverwritePolicy::DifferentSize,
            "--prompt" => policy = OverwritePolicy::Prompt,
            _ => rest.push(arg.clone()),
        }
    }
    (policy, rest)
}

async fn scan(context: &mut ClientContext) -> anyhow::Result<()> {
    let found = context.scan().await?;
    if found.is_empty() {
        println!("no servers found");
        return Ok(());
    }
    for discovered in found {
        println!(
            "{} {}:{}{}{}",
            discovered.descriptor.name,
            discovered.source.ip(),
            discovered.descriptor.port,
            if discovered.descriptor.ssl { " (ssl)" } else { "" },
            if discovered.descriptor.auth {
                " (auth)"
            } else {
                ""
            }
        );
        for sharing in &discovered.descriptor.sharings {
            println!(
                "  {} ({:?}{})",
                sharing.name,
                sharing.kind,
                if sharing.read_only { ", read-only" } else { "" }
            );
        }
    }
    Ok(())
}

async fn connect(context: &mut ClientContext, args: &[String]) -> anyhow::Result<()> {
    let Some(target) = args.first() else {
        anyhow::bail!("usage: connect HOST[:PORT] [ssl]");
    };
    let ssl = args.iter().any(|arg| arg == "ssl");
    let addr = parse_target(target)?;
    let connection = Connection::open(addr, ssl, None).await?;
    println!(
        "connected to {} ({})",
        connection.descriptor.name, connection.peer
    );
    context
        .cache
        .insert(
            connection.descriptor.name.clone(),
            remote::discovery::Discovered {
                descriptor: connection.descriptor.clone(),
                source: connection.peer,
            },
        );
    context.connection = Some(connection);
    Ok(())
}

fn parse_target(target: &str) -> anyhow::Result<std::net::SocketAddr> {
    if let Ok(addr) = target.parse::<std::net::SocketAddr>() {
        return Ok(addr);
    }
    let with_default = format!("{}:{}", target, remote::protocol::DEFAULT_CONTROL_PORT);
    use std::net::ToSocketAddrs;
    with_default
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .or_else(|| {
            target
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
        })
        .ok_or_else(|| anyhow::anyhow!("cannot resolve {target:?}"))
}

fn print_descriptor(connection: &Connection) {
    let descriptor = &connection.descriptor;
    println!("name:     {}", descriptor.name);
    println!("address:  {}", connection.peer);
    println!("version:  {}", descriptor.version);
    println!("ssl:      {}", descriptor.ssl);
    if let Some(fingerprint) = &descriptor.ssl_fingerprint {
        println!("ssl fingerprint: {fingerprint}");
    }
    println!("auth:     {}", descriptor.auth);
    println!("rexec:    {}", descriptor.rexec);
    println!("sharings: {}", descriptor.sharings.len());
}

fn print_entries(entries: &[EntryInfo]) {
    for entry in entries {
        let marker = match entry.kind {
            EntryKind::Directory => "/",
            EntryKind::Symlink => "@",
            EntryKind::File => "",
        };
        let mtime = chrono::DateTime::from_timestamp(
            entry.mtime_nsec.div_euclid(1_000_000_000),
            entry.mtime_nsec.rem_euclid(1_000_000_000) as u32,
        )
        .map(|stamp| stamp.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
        println!(
            "{:>10}  {:16}  {}{}",
            bytesize::ByteSize(entry.size).to_string(),
            mtime,
            entry.name,
            marker
        );
    }
}

fn print_outcomes(outcomes: &[BatchOutcome]) {
    for outcome in outcomes {
        if outcome.ok {
            println!("{}: ok", outcome.path);
        } else {
            let code = outcome
                .error
                .map(|code| code.to_string())
                .unwrap_or_else(|| "error".to_string());
            println!("{}: {}", outcome.path, code);
        }
    }
}

fn print_help() {
    println!("server discovery:  scan, connect HOST[:PORT] [ssl], open NAME, close");
    println!("session:           auth PASSWORD, ping, info, list");
    println!("remote fs:         rpwd, rcd, rls, rtree, rmkdir, rmv, rcp, rrm, rfind");
    println!("transfers:         get [PATH...], put LOCAL_PATH...");
    println!("                   policy flags: -y -n --newer --different-size --prompt");
    println!("remote execution:  rexec COMMAND..., rshell");
    println!("other:             help, exit");
}
