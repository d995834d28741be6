mod config;
mod event_loop;
mod input;

use std::io::IsTerminal;

use clap::Parser;
use config::{Cli, Config};
use ember_pty::{wake_channel, ChildExit, PtyError, Session};
use event_loop::View;
use log::info;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match Config::resolve(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("fatal: cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run(config));
    // A stdin read may still be parked on a blocking thread; don't wait for it.
    runtime.shutdown_background();

    match result {
        Ok(exit) => info!("ember finished, child status {:?}", exit.map(|e| e.code)),
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<Option<ChildExit>, PtyError> {
    let (notifier, wake) = wake_channel();
    let session = Session::spawn(&config.session_config(), notifier)?;
    info!(
        "session started: {:?} (pid {:?}), scrollback {} bytes",
        config.command,
        session.pid(),
        config.scrollback_bytes
    );

    let view = View::new(
        config.viewport(),
        config.placeholder_byte(),
        config.scroll_lines,
        std::io::stdout().is_terminal(),
    );
    event_loop::run(session, wake, view, config.poll_timeout()).await
}
