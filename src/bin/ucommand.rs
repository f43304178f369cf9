//! Interactive module-command console (§6, §4.7).
//!
//! Connects read-only to the process table to answer `list`, then opens a
//! `LocalRequestor` session against a chosen module for `connect <module>`.
//! Grounded in `examples/original_source/src/modules/uCommand.cpp`'s REPL
//! shape, re-expressed with `clap` for argument parsing and `tracing` for
//! diagnostics rather than stdout logging.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use umps::command::{CommandReturnCode, LocalRequestor, ProcessTable};
use umps::storage::{DatabaseConfig, DatabaseConnection, DatabasePath};
use umps::transport::Context;

/// Interactive module-command console.
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the process table's sqlite database.
    #[arg(long)]
    database: PathBuf,

    /// Directory holding modules' `<name>.ipc` socket files.
    #[arg(long)]
    ipc_directory: PathBuf,
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}$ ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_help() {
    println!("Options:");
    println!("  list              - list known modules");
    println!("  connect <module>  - open an interactive session with a module");
    println!("  help              - show this message");
    println!("  quit              - exit");
}

#[tokio::main]
async fn main() -> umps::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = DatabaseConfig::new(DatabasePath::new(&args.database)?);
    let connection = DatabaseConnection::initialize(config).await?;
    let process_table = ProcessTable::new(connection.pool().clone());
    let context = Context::new();

    loop {
        let command = prompt("uCommand").map_err(umps::Error::Io)?;
        match command.as_str() {
            "quit" => break,
            "list" => {
                let modules = process_table.list().await?;
                for module in modules {
                    println!("{} ({:?})", module.module_name, module.application_status);
                }
            }
            cmd if cmd.starts_with("connect") => {
                let module_name = cmd.split_whitespace().nth(1);
                let Some(module_name) = module_name else {
                    eprintln!("Appropriate usage is: connect <module>");
                    continue;
                };
                connect_session(&context, &args.ipc_directory, module_name).await;
            }
            "" | "help" => print_help(),
            other => println!("Unhandled command: {other}"),
        }
    }
    Ok(())
}

async fn connect_session(context: &Context, ipc_directory: &std::path::Path, module_name: &str) {
    let mut requestor = LocalRequestor::new(context.clone());
    if let Err(e) = requestor.initialize(ipc_directory, module_name) {
        eprintln!("{e}");
        return;
    }
    match requestor.available_commands().await {
        Ok(help_text) => println!("{help_text}"),
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    }
    println!("-----------------------------------------------------");
    println!("To terminate session use: hangup");
    loop {
        let Ok(command) = prompt(module_name) else {
            break;
        };
        if command == "hangup" {
            break;
        }
        match requestor.command(&command).await {
            Ok((response, CommandReturnCode::Success)) => println!("{response}"),
            Ok((response, code)) => println!("{response} ({code:?})"),
            Err(e) => {
                eprintln!("{e}");
                break;
            }
        }
    }
    println!("-----------------------------------------------------");
}
