//! CLI surface for the `spacedock` binary.

use std::time::Duration;

use clap::{Parser, Subcommand};

use spacedock_surface::ipc::{
    Ctx, IpcClient, IpcError, Notification, Request, ResponseData,
};

use crate::error::Error;

#[derive(Parser, Debug)]
#[command(name = "spacedock", about = "Multi-tenant bundle filesystem daemon", version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon in the foreground.
    Run,
    /// Check whether a daemon is answering.
    Ping,
    /// Show loaded bundles and their connection health.
    Status,
    /// Ask the daemon to stop.
    Shutdown,
    /// Wait for and print the next notifications (debugging aid).
    Listen {
        /// How long to wait, in seconds.
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

pub fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Run => "run",
        Command::Ping => "ping",
        Command::Status => "status",
        Command::Shutdown => "shutdown",
        Command::Listen { .. } => "listen",
    }
}

pub fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Run => {
            let handle = crate::daemon::run_daemon()?;
            handle.join();
            Ok(())
        }
        Command::Ping => {
            let response = request(Request::Ping { ctx: Ctx::default() })?;
            match response {
                Some(ResponseData::Pong { version }) => {
                    println!("daemon up (version {version})");
                }
                _ => println!("daemon up"),
            }
            Ok(())
        }
        Command::Status => {
            let response = request(Request::Status { ctx: Ctx::default() })?;
            if let Some(ResponseData::Status { bundles }) = response {
                if bundles.is_empty() {
                    println!("no bundles loaded");
                }
                for bundle in bundles {
                    println!(
                        "{}\t{}\thealthy={}\tattempts={}\twatchers={}",
                        bundle.launcher_bundle_id,
                        bundle.state,
                        bundle.connection_healthy,
                        bundle.reconnect_attempts,
                        bundle.watcher_count
                    );
                }
            }
            Ok(())
        }
        Command::Shutdown => {
            request(Request::Shutdown { ctx: Ctx::default() })?;
            println!("daemon stopping");
            Ok(())
        }
        Command::Listen { seconds } => {
            let mut client = connect()?;
            let deadline = std::time::Instant::now() + Duration::from_secs(seconds);
            while std::time::Instant::now() < deadline {
                match client.next_notification(Duration::from_millis(500))? {
                    Some(notification) => print_notification(&notification),
                    None => continue,
                }
            }
            Ok(())
        }
    }
}

fn connect() -> Result<IpcClient, IpcError> {
    IpcClient::connect(&spacedock_surface::ipc::socket_path())
}

fn request(request: Request) -> Result<Option<ResponseData>, Error> {
    let mut client = connect().map_err(Error::Ipc)?;
    let response = client.request(&request).map_err(Error::Ipc)?;
    if !response.success {
        let message = response
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown daemon error".to_string());
        return Err(Error::Ipc(IpcError::DaemonUnavailable(message)));
    }
    Ok(response.data)
}

fn print_notification(notification: &Notification) {
    match serde_json::to_string(notification) {
        Ok(line) => println!("{line}"),
        Err(_) => println!("{notification:?}"),
    }
}
