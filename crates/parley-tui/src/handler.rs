use std::path::Path;

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use parley_core::UserInput;

use crate::app::App;
use crate::tui::AppEvent;

const VOICE_COMMAND: &str = "/voice ";
const PAGE: u16 = 10;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub async fn handle_event(app: &mut App, event: AppEvent) -> Result<()> {
    match event {
        AppEvent::Key(key) => handle_key(app, key).await?,
        AppEvent::Resize(_, _) => {
            if app.follow {
                app.scroll_to_bottom();
            }
        }
        AppEvent::Tick => {
            app.tick_animation();
        }
    }
    Ok(())
}

async fn handle_key(app: &mut App, key: KeyEvent) -> Result<()> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        match key.code {
            KeyCode::Char('c') => app.should_quit = true,
            KeyCode::Char('r') => {
                app.notice = None;
                app.dispatch(UserInput::Reconnect);
            }
            KeyCode::Char('d') => app.dispatch(UserInput::Disconnect),
            KeyCode::Char('u') => app.clear_input(),
            _ => {}
        }
        return Ok(());
    }

    match key.code {
        KeyCode::Esc => app.should_quit = true,
        KeyCode::Enter => submit(app).await,
        KeyCode::PageUp => app.scroll_up(PAGE),
        KeyCode::PageDown => app.scroll_down(PAGE),
        KeyCode::Up => app.scroll_up(1),
        KeyCode::Down => app.scroll_down(1),
        KeyCode::Backspace => {
            if app.cursor > 0 {
                app.cursor -= 1;
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let char_count = app.input.chars().count();
            if app.cursor < char_count {
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.cursor = app.cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.input.chars().count();
            app.cursor = (app.cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.cursor = 0;
        }
        KeyCode::End => {
            app.cursor = app.input.chars().count();
        }
        KeyCode::Char(c) => {
            let byte_pos = char_to_byte_index(&app.input, app.cursor);
            app.input.insert(byte_pos, c);
            app.cursor += 1;
        }
        _ => {}
    }

    Ok(())
}

/// Send the input line: plain text, or `/voice <file>` to upload a recording
async fn submit(app: &mut App) {
    let line = app.input.trim().to_string();
    if line.is_empty() {
        return;
    }

    let input = match line.strip_prefix(VOICE_COMMAND) {
        Some(path) => match read_recording(Path::new(path.trim())).await {
            Ok(input) => input,
            Err(e) => {
                app.notice = Some(e.to_string());
                return;
            }
        },
        None => UserInput::SendText(line),
    };

    app.notice = None;
    app.clear_input();
    app.dispatch(input);
    app.follow = true;
    app.scroll_to_bottom();
}

async fn read_recording(path: &Path) -> Result<UserInput> {
    let audio = tokio::fs::read(path)
        .await
        .map_err(|e| anyhow::anyhow!("Could not read {}: {}", path.display(), e))?;
    if audio.is_empty() {
        anyhow::bail!("{} is empty", path.display());
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording.wav".to_string());

    Ok(UserInput::SendVoice { audio, file_name })
}
