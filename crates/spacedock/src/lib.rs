#![forbid(unsafe_code)]

//! spacedock: a multi-tenant bundle filesystem daemon.
//!
//! Hosts N independently loaded application bundles, each backed by its own
//! document store; serves their virtual filesystems, watches files on
//! behalf of clients, supervises per-bundle sync connections, and resumes
//! the last active bundle after a restart.

pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod paths;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the wire surface so embedders need only this crate.
pub use spacedock_surface::ipc;

/// Thin orchestration shim for the `spacedock` binary. Entry-point binaries
/// stay as minimal wiring; command behavior lives behind crate boundaries.
pub fn run_cli_entrypoint(cli: cli::Cli) -> i32 {
    let config = config::load();
    telemetry::init(cli.verbose, &config.logging);

    let command = cli::command_name(&cli.command);
    let span = tracing::info_span!("cli_command", command = %command);
    let _guard = span.enter();

    if let Err(err) = cli::run(cli) {
        tracing::error!("error: {err}");
        return 1;
    }
    0
}
