//! starctl - companion CLI for the starsrv daemon.
//!
//! Speaks the RPC protocol over the daemon's unix domain socket. Every
//! command also reports a `wsh:run` activity entry naming the subcommand and
//! whether it errored.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use starsrv::rpc::{PacketParser, RpcMessage, encode_packet};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = CtlClient::connect(&cli.sock, cli.token.as_deref()).await?;

    let activity_key = cli.command.activity_key();
    let result = run_command(&mut client, cli.command, cli.json).await;
    let key = if result.is_ok() {
        activity_key.to_string()
    } else {
        format!("{activity_key}#error")
    };
    let mut activity = serde_json::Map::new();
    activity.insert(key, json!(1));
    let _ = client
        .call("wshactivity", Some(Value::Object(activity)))
        .await;
    result
}

#[derive(Debug, Parser)]
#[command(
    name = "starctl",
    author,
    version,
    about = "Control CLI for the starsrv daemon."
)]
struct Cli {
    /// Path to the daemon's unix socket
    #[arg(long, short = 's', env = "STARTERM_SOCK")]
    sock: PathBuf,

    /// Connect token (defaults to STARTERM_JWT)
    #[arg(long, env = "STARTERM_JWT", hide_env_values = true)]
    token: Option<String>,

    /// Output machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Redeem a shell swap token and print its init script
    Token {
        /// The one-shot swap token
        token: String,
        /// Shell type (bash, zsh, fish, pwsh)
        shell: String,
    },
    /// Get an object's metadata
    Getmeta {
        /// Object reference (otype:oid, or an 8-char oid prefix)
        oref: String,
    },
    /// Merge metadata into an object
    Setmeta {
        /// Object reference
        oref: String,
        /// JSON object of keys to merge
        meta: String,
    },
    /// Connection management
    Conn {
        #[command(subcommand)]
        command: ConnCommand,
    },
    /// Print daemon info
    Info,
    /// Send a debug message to the daemon log
    Message {
        text: String,
    },
    /// Exercise the response-stream path (chunks 1..5)
    Streamtest,
}

#[derive(Debug, Subcommand)]
enum ConnCommand {
    /// Show the status of all connections
    Status,
    /// Connect (re-dialing if already connected)
    Connect { name: String },
    /// Ensure a connection is up
    Ensure { name: String },
    /// Disconnect
    Disconnect { name: String },
    /// Reinstall the remote wsh agent
    Reinstall { name: String },
    /// List known connections
    List,
}

impl Command {
    fn activity_key(&self) -> &'static str {
        match self {
            Command::Token { .. } => "token",
            Command::Getmeta { .. } => "getmeta",
            Command::Setmeta { .. } => "setmeta",
            Command::Conn { command } => match command {
                ConnCommand::Status => "conn:status",
                ConnCommand::Connect { .. } => "conn:connect",
                ConnCommand::Ensure { .. } => "conn:ensure",
                ConnCommand::Disconnect { .. } => "conn:disconnect",
                ConnCommand::Reinstall { .. } => "conn:reinstall",
                ConnCommand::List => "conn:list",
            },
            Command::Info => "info",
            Command::Message { .. } => "message",
            Command::Streamtest => "streamtest",
        }
    }
}

async fn run_command(client: &mut CtlClient, command: Command, json_out: bool) -> Result<()> {
    match command {
        Command::Token { token, shell } => {
            // the exchange happened at connect time when --token was the
            // swap token; this path redeems explicitly
            let data = client
                .call("authenticatetoken", Some(json!({ "token": token })))
                .await;
            match data {
                Ok(Some(data)) => {
                    let _ = shell;
                    if let Some(script) = data.get("initscripttext").and_then(|v| v.as_str()) {
                        println!("{script}");
                    }
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        }
        Command::Getmeta { oref } => {
            let oref = client.resolve_oref(&oref).await?;
            let data = client.call("getmeta", Some(json!({ "oref": oref }))).await?;
            print_value(&data.unwrap_or(Value::Null), json_out);
            Ok(())
        }
        Command::Setmeta { oref, meta } => {
            let meta: Value =
                serde_json::from_str(&meta).context("meta must be a JSON object")?;
            if !meta.is_object() {
                bail!("meta must be a JSON object");
            }
            let oref = client.resolve_oref(&oref).await?;
            client
                .call("setmeta", Some(json!({ "oref": oref, "meta": meta })))
                .await?;
            Ok(())
        }
        Command::Conn { command } => run_conn_command(client, command, json_out).await,
        Command::Info => {
            let data = client.call("starinfo", None).await?;
            print_value(&data.unwrap_or(Value::Null), json_out);
            Ok(())
        }
        Command::Message { text } => {
            client
                .call("message", Some(json!({ "message": text })))
                .await?;
            Ok(())
        }
        Command::Streamtest => {
            let chunks = client.stream("streamtest", None).await?;
            for chunk in chunks {
                println!("{chunk}");
            }
            Ok(())
        }
    }
}

async fn run_conn_command(
    client: &mut CtlClient,
    command: ConnCommand,
    json_out: bool,
) -> Result<()> {
    match command {
        ConnCommand::Status => {
            let ssh = client.call("connstatus", None).await?;
            let wsl = client.call("wslstatus", None).await?;
            let mut all = Vec::new();
            for data in [ssh, wsl].into_iter().flatten() {
                if let Value::Array(items) = data {
                    all.extend(items);
                }
            }
            print_value(&Value::Array(all), json_out);
            Ok(())
        }
        ConnCommand::Connect { name } => {
            client
                .call("connconnect", Some(json!({ "host": name })))
                .await?;
            Ok(())
        }
        ConnCommand::Ensure { name } => {
            client
                .call("connensure", Some(json!({ "connname": name })))
                .await?;
            Ok(())
        }
        ConnCommand::Disconnect { name } => {
            client.call("conndisconnect", Some(json!(name))).await?;
            Ok(())
        }
        ConnCommand::Reinstall { name } => {
            client
                .call("connreinstallwsh", Some(json!({ "connname": name })))
                .await?;
            Ok(())
        }
        ConnCommand::List => {
            let data = client.call("connlist", None).await?;
            print_value(&data.unwrap_or(Value::Null), json_out);
            Ok(())
        }
    }
}

fn print_value(value: &Value, json_out: bool) {
    if json_out {
        println!("{}", serde_json::to_string(value).unwrap_or_default());
    } else {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }
}

/// Minimal RPC client over the unix socket: authenticate, then call/stream.
struct CtlClient {
    stream: UnixStream,
    parser: PacketParser,
    pending: std::collections::VecDeque<RpcMessage>,
    auth_token: String,
    next_reqid: u64,
}

impl CtlClient {
    async fn connect(sock: &PathBuf, jwt: Option<&str>) -> Result<Self> {
        let stream = UnixStream::connect(sock)
            .await
            .with_context(|| format!("connecting to daemon at {}", sock.display()))?;
        let mut client = Self {
            stream,
            parser: PacketParser::new(),
            pending: std::collections::VecDeque::new(),
            auth_token: String::new(),
            next_reqid: 1,
        };
        let Some(jwt) = jwt else {
            bail!("no connect token (set STARTERM_JWT or pass --token)");
        };
        let resp = client
            .roundtrip(RpcMessage {
                command: "authenticate".into(),
                reqid: "auth".into(),
                data: Some(json!(jwt)),
                ..Default::default()
            })
            .await?;
        let data = resp.data.unwrap_or(Value::Null);
        client.auth_token = data
            .get("authtoken")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if client.auth_token.is_empty() {
            bail!("authentication failed");
        }
        Ok(client)
    }

    fn next_reqid(&mut self) -> String {
        let id = self.next_reqid;
        self.next_reqid += 1;
        format!("req{id}")
    }

    async fn call(&mut self, command: &str, data: Option<Value>) -> Result<Option<Value>> {
        let reqid = self.next_reqid();
        let resp = self
            .roundtrip(RpcMessage {
                command: command.to_string(),
                reqid,
                authtoken: self.auth_token.clone(),
                data,
                ..Default::default()
            })
            .await?;
        if !resp.error.is_empty() {
            bail!("{}", resp.error);
        }
        Ok(resp.data)
    }

    /// Issue a streaming call and collect the chunks until the terminal
    /// frame.
    async fn stream(&mut self, command: &str, data: Option<Value>) -> Result<Vec<Value>> {
        let reqid = self.next_reqid();
        self.send(RpcMessage {
            command: command.to_string(),
            reqid: reqid.clone(),
            authtoken: self.auth_token.clone(),
            data,
            ..Default::default()
        })
        .await?;
        let mut chunks = Vec::new();
        loop {
            let msg = self.read_frame().await?;
            if msg.resid != reqid {
                continue;
            }
            if !msg.error.is_empty() {
                bail!("{}", msg.error);
            }
            if let Some(data) = msg.data {
                chunks.push(data);
            }
            if !msg.cont {
                break;
            }
        }
        Ok(chunks)
    }

    async fn roundtrip(&mut self, msg: RpcMessage) -> Result<RpcMessage> {
        let reqid = msg.reqid.clone();
        self.send(msg).await?;
        loop {
            let frame = self.read_frame().await?;
            if frame.resid == reqid {
                return Ok(frame);
            }
        }
    }

    async fn send(&mut self, msg: RpcMessage) -> Result<()> {
        self.stream.write_all(&encode_packet(&msg)).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<RpcMessage> {
        let mut buf = [0u8; 4096];
        loop {
            // events pushed by the daemon are not responses
            while let Some(msg) = self.pending.pop_front() {
                if msg.command != "eventrecv" {
                    return Ok(msg);
                }
            }
            let read = tokio::time::timeout(CALL_TIMEOUT, self.stream.read(&mut buf))
                .await
                .context("timed out waiting for daemon")??;
            if read == 0 {
                bail!("daemon closed the connection");
            }
            for frame in self.parser.feed(&buf[..read]) {
                match frame {
                    Ok(msg) => self.pending.push_back(msg),
                    Err(e) => bail!("bad frame from daemon: {e}"),
                }
            }
        }
    }

    /// Accept either a full oref or an easy oid prefix.
    async fn resolve_oref(&mut self, oref: &str) -> Result<String> {
        if oref.contains(':') {
            return Ok(oref.to_string());
        }
        let data = self
            .call("resolveids", Some(json!({ "ids": [oref] })))
            .await?
            .unwrap_or(Value::Null);
        let resolved = data
            .get("resolvedids")
            .and_then(|m| m.get(oref))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        resolved.ok_or_else(|| anyhow::anyhow!("could not resolve id {oref:?}"))
    }
}

// activity keys are validated server-side against ^[a-z:#]+$ and a 20-char
// cap; keep the table above inside both
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_keys_are_valid() {
        let keys = [
            "token",
            "getmeta",
            "setmeta",
            "conn:status",
            "conn:connect",
            "conn:ensure",
            "conn:disconnect",
            "conn:reinstall",
            "conn:list",
            "info",
            "message",
            "streamtest",
        ];
        for key in keys {
            assert!(key.len() <= 20, "{key} too long");
            assert!(
                key.chars().all(|c| c.is_ascii_lowercase() || c == ':' || c == '#'),
                "{key} has invalid chars"
            );
        }
    }

    #[test]
    fn test_error_suffix_stays_valid() {
        let key = format!("{}#error", "conn:status");
        assert!(key.len() <= 20);
    }
}
