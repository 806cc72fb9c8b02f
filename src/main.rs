//! blueshift-ipc command-line front-end
//!
//! - `serve`: run the notification server until SIGINT or SIGTERM
//! - `attach`: print server notices and forward stdin lines to the server
//! - `signal <action>`: send a control signal to the running server

use blueshift_ipc::config::{Command, Config};
use blueshift_ipc::server::IgnoreCommands;
use blueshift_ipc::{ControlAction, NoticeHandler, Server, Session, SettingsBundle};
use std::error::Error;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long `signal` waits for the server to announce its PID.
const PID_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<(), Box<dyn Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout belongs to `attach`
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.command.clone() {
        Command::Serve => runtime.block_on(serve(config)),
        Command::Attach => runtime.block_on(attach(config)),
        Command::Signal { action } => runtime.block_on(send_signal(config, action)),
    }
}

/// Run the server until SIGINT or SIGTERM
async fn serve(config: Config) -> Result<(), Box<dyn Error>> {
    info!(
        socket = %config.socket.display(),
        max_clients = config.max_clients,
        settings = config.settings.len(),
        "Starting blueshift-ipc server"
    );

    let server = Server::bind(config.server_options())?;
    server.run(IgnoreCommands, shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                () = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGTERM");
            ctrl_c.await;
        }
    }
}

/// Prints notices on stdout.
struct Printer;

impl NoticeHandler for Printer {
    fn pid(&mut self, pid: u32) {
        println!("Server PID: {}", pid);
    }

    fn script_changed(&mut self, script: Option<&str>) {
        println!("Script: {}", script.unwrap_or("(none)"));
    }

    fn settings(&mut self, settings: &SettingsBundle) {
        for setting in settings {
            println!(
                "  {} ({}): {} [default {}]",
                setting.name(),
                setting.title(),
                setting.current_value(),
                setting.default_value()
            );
        }
    }

    fn command(&mut self, command: &str, payload: &str) {
        println!("{}: {}", command, payload);
    }

    fn closed(&mut self) {
        println!("Server closed the connection");
    }
}

/// Print notices and forward stdin lines until the server goes away
async fn attach(config: Config) -> Result<(), Box<dyn Error>> {
    let mut session = Session::connect(&config.socket).await?;
    let mut printer = Printer;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            more = session.next(&mut printer) => {
                if !more? {
                    printer.closed();
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => session.send_line(&line).await?,
                None => stdin_open = false,
            },
        }
    }

    Ok(())
}

/// Ignores everything; used while waiting for the PID.
struct Quiet;

impl NoticeHandler for Quiet {}

/// Connect, learn the server PID, and signal it
async fn send_signal(config: Config, action: ControlAction) -> Result<(), Box<dyn Error>> {
    let mut session = Session::connect(&config.socket).await?;

    let announced = tokio::time::timeout(PID_TIMEOUT, async {
        while session.server_pid().is_none() {
            if !session.next(&mut Quiet).await? {
                return Ok(false);
            }
        }
        Ok::<_, blueshift_ipc::TransportError>(true)
    })
    .await;

    let control = match (announced, session.control()) {
        (Ok(Ok(true)), Some(control)) => control?,
        (Ok(Err(e)), _) => return Err(e.into()),
        (Err(_), _) => return Err("timed out waiting for the server PID".into()),
        _ => return Err("server closed the connection before announcing its PID".into()),
    };

    control.signal(action)?;
    info!(pid = control.pid(), action = ?action, "Signal sent");
    session.close().await;
    Ok(())
}
