use clap::Parser;

fn main() {
    let cli = spacedock::cli::Cli::parse();
    std::process::exit(spacedock::run_cli_entrypoint(cli));
}
