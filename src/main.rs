use clap::{Parser, Subcommand};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gatework-combined")]
#[command(about = "Gatework - combined game server and client launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server and a CLI client together
    Both {
        /// Port for the server
        #[arg(short, long, default_value = "10000")]
        port: u16,
    },
    /// Run only the server
    Server {
        /// Port for the server
        #[arg(short, long, default_value = "10000")]
        port: u16,
    },
    /// Run only a CLI client
    Client,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Both { port } => {
            run_both(port);
        }
        Commands::Server { port } => {
            run_server(port);
        }
        Commands::Client => {
            run_client();
        }
    }
}

fn run_both(port: u16) {
    println!("🚀 Starting gatework server on port {port} + CLI client");

    let server_handle = thread::spawn(move || {
        run_server(port);
    });

    // Give the server a moment to bind before the client dials it.
    thread::sleep(Duration::from_millis(1500));
    run_client();

    let _ = server_handle.join();
}

fn run_server(port: u16) {
    let status = Command::new("cargo")
        .args(["run", "-p", "gatework-server"])
        .env("PORT", port.to_string())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    match status {
        Ok(exit_status) => {
            if !exit_status.success() {
                eprintln!("❌ Server exited with error: {exit_status}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start server: {e}");
            std::process::exit(1);
        }
    }
}

fn run_client() {
    let status = Command::new("cargo")
        .args(["run", "--bin", "cli_client"])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    match status {
        Ok(exit_status) => {
            if !exit_status.success() {
                eprintln!("❌ Client exited with error: {exit_status}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start client: {e}");
            std::process::exit(1);
        }
    }
}
