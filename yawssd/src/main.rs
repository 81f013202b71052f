use clap::{Parser, Subcommand};

mod server;

/// WebSocket server CLI tool
///
/// Runs an echo server: every message a client sends is sent back to it.
///
/// Examples:
///   yawssd serve --port 9000 --protocol chat
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Log every frame and connection event.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Serve(server::Cmd),
}

fn main() {
    let args = Cli::parse();

    let level = if args.verbose {
        log::Level::Trace
    } else {
        log::Level::Info
    };
    if let Err(err) = simple_logger::init_with_level(level) {
        eprintln!("{:?}", err);
    }

    let res = match args.command {
        Commands::Serve(cmd) => server::run(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
    }
}
