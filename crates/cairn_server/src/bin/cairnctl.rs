//! Operator CLI: send commands to a cairn node and print the response.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cairn_server::message::Message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(70);

#[derive(Parser, Debug)]
#[command(name = "cairnctl")]
struct Args {
    /// Command port of the target node.
    #[arg(long)]
    target: SocketAddr,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and pretty-print the node status.
    Status,
    /// Send an arbitrary command.
    Send {
        method: String,
        /// Repeatable `name=value` request headers.
        #[arg(long = "header")]
        headers: Vec<String>,
        #[arg(long)]
        body: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let request = match &args.cmd {
        Command::Status => Message::new("Status"),
        Command::Send {
            method,
            headers,
            body,
        } => {
            let mut msg = Message::new(method.clone());
            for header in headers {
                let (name, value) = header
                    .split_once('=')
                    .with_context(|| format!("header {header:?} is not name=value"))?;
                msg.set(name, value);
            }
            if let Some(body) = body {
                msg.set_body(body.clone());
            }
            msg
        }
    };

    let stream = TcpStream::connect_timeout(&args.target, CONNECT_TIMEOUT)
        .with_context(|| format!("connect to {}", args.target))?;
    stream
        .set_read_timeout(Some(RESPONSE_TIMEOUT))
        .context("set read timeout")?;
    stream
        .set_write_timeout(Some(CONNECT_TIMEOUT))
        .context("set write timeout")?;
    let mut writer = stream.try_clone().context("clone stream")?;
    writer
        .write_all(&request.to_bytes())
        .context("send command")?;

    let mut reader = BufReader::new(stream);
    let Some(response) = Message::read_from(&mut reader).context("read response")? else {
        anyhow::bail!("empty response (the node died handling the command)");
    };

    match args.cmd {
        Command::Status if response.is_success() => {
            let value: serde_json::Value =
                serde_json::from_slice(&response.body).context("parse status body")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            println!("{}", response.method_line);
            if !response.body.is_empty() {
                println!("{}", response.body_str());
            }
        }
    }

    if response.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
