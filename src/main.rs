mod app;
mod catalogue;
mod config;
mod error;
mod icon;
mod sni;
mod x11;

use std::process::ExitCode;

use tokio::signal::unix::{SignalKind, signal};

use app::App;
use error::Error;

fn main() -> ExitCode {
    if std::env::args().nth(1).as_deref() == Some("-v") {
        eprintln!("snidock-{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::FAILURE;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("snidock starting");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("cannot build runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Bring both connections up, then hand over to the bridge loop. An
/// error here is a start-up failure; once the loop runs, shutdown always
/// comes back as `Ok` and the process exits cleanly.
async fn run() -> Result<(), Error> {
    // Handlers must be in place before any connection setup; an
    // interrupt during start-up still has to exit through cleanup.
    let sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::Startup(format!("cannot install signal handler: {e}")))?;
    let sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::Startup(format!("cannot install signal handler: {e}")))?;

    let display = x11::DisplayContext::connect()?;

    let bus = zbus::Connection::session()
        .await
        .map_err(|e| Error::Startup(format!("cannot connect to session bus: {e}")))?;
    // The stream must exist before the names do, or early registrations
    // would be dropped on the floor.
    let stream = zbus::MessageStream::from(&bus);
    sni::claim_names(&bus).await?;
    sni::add_signal_matches(&bus).await?;

    log::info!("claimed {}, bridging items to the XEMBED tray", sni::WATCHER_NAME);

    let mut app = App::new(display, bus, stream, sigint, sigterm)?;
    app.run().await?;
    app.cleanup();
    Ok(())
}
