// SnapGuard - main.rs
// Entry point: parse the command line, wire Ctrl-C to cancellation, map errors to exit codes

use clap::Parser;
use std::process::ExitCode;

use snapguard::cli::{dispatch, Cli};
use snapguard::CancelToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let cancel = CancelToken::new();

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, stopping after the current file");
            on_interrupt.cancel();
        }
    });

    match dispatch(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::from(e.exit_code())
        }
    }
}
