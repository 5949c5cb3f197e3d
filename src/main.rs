use clap::Parser;
use log::{error, info};
use udpfile::cli::{Cli, Commands};
use udpfile::file::default_output_path;
use udpfile::stream::{
    receive::{ReceiverConfig, receive_file},
    send::SenderConfig,
    serve::{MAX_SESSIONS_CAP, Server, ServerConfig},
};

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let max_sessions = args.max_sessions.clamp(1, MAX_SESSIONS_CAP);
            if max_sessions != args.max_sessions {
                info!(
                    "Capped max sessions from {} to {}",
                    args.max_sessions, max_sessions
                );
            }
            let config = ServerConfig {
                root: args.root,
                max_sessions,
                sender: SenderConfig::default(),
            };

            let server = match Server::bind((args.bind.as_str(), args.port), config) {
                Ok(server) => server,
                Err(e) => {
                    error!("Failed to bind {}:{}: {}", args.bind, args.port, e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = server.run() {
                error!("Server stopped: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Get(args) => {
            let output = args
                .output
                .clone()
                .unwrap_or_else(|| default_output_path(&args.file));
            let config = ReceiverConfig {
                corruption_rate: args.corruption_rate(),
                ..Default::default()
            };

            match receive_file(&args.server, &args.file, &output, config) {
                Ok(report) => match report.first_missing {
                    None => info!("File {:?} received successfully!", args.file),
                    Some(seq) => info!(
                        "File {:?} received, truncated at missing chunk {}",
                        args.file, seq
                    ),
                },
                Err(e) => {
                    error!("Transfer failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
