use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Result;
use parley_core::{ChatController, ChatHandle, ChatView, Config};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod app;
mod handler;
mod tui;
mod ui;

use app::App;
use tui::{EventHandler, Tui};

/// Logs go to a file; stderr belongs to the terminal UI
fn init_logging() -> Result<()> {
    let Some(log_dir) = dirs::cache_dir().map(|dir| dir.join("parley")) else {
        return Ok(());
    };
    std::fs::create_dir_all(&log_dir)?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("parley.log"))?;

    let filter = EnvFilter::try_from_env("PARLEY_LOG")
        .unwrap_or_else(|_| EnvFilter::new("parley_core=info,parley=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_target(false)
        .try_init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = Config::load()?;
    let controller = ChatController::with_defaults(config)?;
    let handle = ChatHandle::spawn(controller);
    let mut view = handle.view();

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();
    let mut app = App::new(view.borrow().clone());

    let result = run(&mut terminal, &mut app, &mut events, &mut view, &handle).await;

    tui::restore()?;
    handle.shutdown().await;
    result
}

async fn run(
    terminal: &mut Tui,
    app: &mut App,
    events: &mut EventHandler,
    view: &mut watch::Receiver<ChatView>,
    handle: &ChatHandle,
) -> Result<()> {
    loop {
        terminal.draw(|frame| ui::render(app, frame))?;

        tokio::select! {
            event = events.next() => match event {
                Some(event) => handler::handle_event(app, event).await?,
                None => break,
            },
            changed = view.changed() => {
                if changed.is_err() {
                    tracing::warn!("controller stopped");
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                app.update_view(snapshot);
            }
        }

        for input in app.take_outbox() {
            if !handle.send(input) {
                app.should_quit = true;
            }
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}
