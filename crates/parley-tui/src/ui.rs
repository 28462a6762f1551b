use std::time::Instant;

use parley_core::{AudioStatus, BotStatus, ChatView, ConnectionState, Role, TransportMode};
use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
    Frame,
};

use crate::app::App;

/// Parse a line of text with **bold** markers into styled spans
fn parse_markdown_line(text: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut chars = text.chars().peekable();
    let mut current_text = String::new();

    while let Some(c) = chars.next() {
        if c == '*' && chars.peek() == Some(&'*') {
            chars.next();

            if !current_text.is_empty() {
                spans.push(Span::raw(std::mem::take(&mut current_text)));
            }

            // Find closing **
            let mut bold_text = String::new();
            let mut found_close = false;
            while let Some(c) = chars.next() {
                if c == '*' && chars.peek() == Some(&'*') {
                    chars.next();
                    found_close = true;
                    break;
                }
                bold_text.push(c);
            }

            if found_close && !bold_text.is_empty() {
                spans.push(Span::styled(
                    bold_text,
                    Style::default().add_modifier(Modifier::BOLD),
                ));
            } else {
                // No closing **, treat as literal
                current_text.push_str("**");
                current_text.push_str(&bold_text);
            }
        } else {
            current_text.push(c);
        }
    }

    if !current_text.is_empty() {
        spans.push(Span::raw(current_text));
    }

    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

/// Connection indicator text and colour
fn connection_label(view: &ChatView, now: Instant) -> (String, Color) {
    if view.transport == TransportMode::Http {
        return ("● HTTP".to_string(), Color::Green);
    }

    let conn = &view.connection;
    match &conn.state {
        ConnectionState::Open => ("● Connected".to_string(), Color::Green),
        ConnectionState::Connecting => (
            format!("◌ Connecting ({}/{})", conn.attempt.max(1), conn.max_attempts),
            Color::Yellow,
        ),
        ConnectionState::Closing => ("◌ Closing".to_string(), Color::DarkGray),
        ConnectionState::Errored => (
            "✕ Connection failed, Ctrl-R to retry".to_string(),
            Color::Red,
        ),
        ConnectionState::Idle | ConnectionState::Closed(_) => match conn.retry_at {
            Some(at) => {
                let secs = at.saturating_duration_since(now).as_secs_f32().ceil() as u64;
                (
                    format!(
                        "○ Disconnected, retry {}/{} in {}s",
                        conn.attempt, conn.max_attempts, secs
                    ),
                    Color::Yellow,
                )
            }
            None => ("○ Disconnected".to_string(), Color::DarkGray),
        },
    }
}

fn audio_line(status: &AudioStatus) -> Line<'static> {
    let (text, color) = match status {
        AudioStatus::Fetching => ("♪ fetching audio…".to_string(), Color::DarkGray),
        AudioStatus::Ready(path) => (format!("♪ {}", path.display()), Color::Green),
        AudioStatus::Failed(reason) => (format!("♪ audio unavailable: {}", reason), Color::Red),
    };
    Line::from(Span::styled(text, Style::default().fg(color)))
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    let [header_area, chat_area, status_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_status(app, frame, status_area);
    render_input(app, frame, input_area);
    render_footer(frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let session = app
        .view
        .session_id
        .as_deref()
        .map(|id| format!(" [{}]", id))
        .unwrap_or_default();

    let title = Line::from(vec![
        Span::styled(" Parley ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(session, Style::default().fg(Color::Gray)),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    // Store inner size for scroll calculation
    app.chat_width = area.width.saturating_sub(2);
    app.chat_height = area.height.saturating_sub(2);
    if app.follow {
        app.scroll_to_bottom();
    }

    let chat_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(" Chat ");

    let view = &app.view;
    let chat_text = if view.messages.is_empty() && view.bot_status == BotStatus::Idle {
        Text::from(Span::styled(
            "Type a message and press Enter...",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        let you = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
        let ai = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);
        let mut lines: Vec<Line> = Vec::new();

        for msg in &view.messages {
            match msg.role {
                Role::User => {
                    lines.push(Line::from(Span::styled("You:", you)));
                    for line in msg.content.lines() {
                        lines.push(Line::from(line.to_string()));
                    }
                }
                Role::Assistant => {
                    lines.push(Line::from(Span::styled("AI:", ai)));
                    for line in msg.content.lines() {
                        lines.push(parse_markdown_line(line));
                    }
                }
                Role::System => {
                    for line in msg.content.lines() {
                        lines.push(Line::from(Span::styled(
                            line.to_string(),
                            Style::default()
                                .fg(Color::DarkGray)
                                .add_modifier(Modifier::ITALIC),
                        )));
                    }
                }
            }
            if let Some(status) = app.audio_status(msg.order) {
                lines.push(audio_line(status));
            }
            lines.push(Line::default());
        }

        match &view.streaming {
            Some(partial) => {
                lines.push(Line::from(Span::styled("AI:", ai)));
                for line in partial.lines() {
                    lines.push(parse_markdown_line(line));
                }
            }
            None if view.bot_status == BotStatus::Thinking => {
                lines.push(Line::from(Span::styled("AI:", ai)));
                // Animated ellipsis: cycles through ".", "..", "..."
                let dots = ".".repeat((app.animation_frame as usize) + 1);
                lines.push(Line::from(Span::styled(
                    format!("Thinking{}", dots),
                    Style::default()
                        .fg(Color::DarkGray)
                        .add_modifier(Modifier::ITALIC),
                )));
            }
            None => {}
        }

        Text::from(lines)
    };

    let chat = Paragraph::new(chat_text)
        .block(chat_block)
        .wrap(Wrap { trim: true })
        .scroll((app.scroll, 0));

    frame.render_widget(chat, area);
}

fn render_status(app: &App, frame: &mut Frame, area: Rect) {
    let (label, color) = connection_label(&app.view, Instant::now());
    let mut spans = vec![Span::styled(format!(" {} ", label), Style::default().fg(color))];

    match app.view.bot_status {
        BotStatus::Idle => {}
        BotStatus::Thinking => spans.push(Span::styled(
            " thinking ",
            Style::default().fg(Color::Yellow),
        )),
        BotStatus::Generating => spans.push(Span::styled(
            " generating ",
            Style::default().fg(Color::Yellow),
        )),
    }

    if let Some(health) = &app.view.api_health {
        let color = if health == "ok" { Color::Green } else { Color::Yellow };
        spans.push(Span::styled(
            format!(" api: {} ", health),
            Style::default().fg(color),
        ));
    }

    if let Some(notice) = &app.notice {
        spans.push(Span::styled(
            format!(" {} ", notice),
            Style::default().fg(Color::Red),
        ));
    }

    let conn = &app.view.connection;
    let retrying = conn.retry_at.is_some() && conn.max_attempts > 0;
    if !retrying {
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
        return;
    }

    let [label_area, gauge_area] =
        Layout::horizontal([Constraint::Min(0), Constraint::Length(20)]).areas(area);
    frame.render_widget(Paragraph::new(Line::from(spans)), label_area);

    let ratio = (conn.attempt as f64 / conn.max_attempts as f64).clamp(0.0, 1.0);
    let gauge = Gauge::default()
        .gauge_style(Style::default().fg(Color::Yellow).bg(Color::Black))
        .ratio(ratio)
        .label(format!("retry {}/{}", conn.attempt, conn.max_attempts));
    frame.render_widget(gauge, gauge_area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Message (/voice <file> to send a recording) ");

    // Horizontal scroll so the cursor stays visible
    let inner_width = area.width.saturating_sub(2) as usize;
    let scroll_offset = if inner_width > 0 && app.cursor >= inner_width {
        app.cursor - inner_width + 1
    } else {
        0
    };

    let visible_text: String = app
        .input
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(input_block);
    frame.render_widget(input, area);

    let cursor_x = (app.cursor - scroll_offset) as u16;
    frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
}

fn render_footer(frame: &mut Frame, area: Rect) {
    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let hints = vec![
        Span::styled(" CHAT ", Style::default().bg(Color::Blue).fg(Color::White)),
        Span::styled(" ", label_style),
        Span::styled(" Enter ", key_style),
        Span::styled(" send ", label_style),
        Span::styled(" PgUp/PgDn ", key_style),
        Span::styled(" scroll ", label_style),
        Span::styled(" ^R ", key_style),
        Span::styled(" reconnect ", label_style),
        Span::styled(" ^D ", key_style),
        Span::styled(" disconnect ", label_style),
        Span::styled(" Esc ", key_style),
        Span::styled(" quit ", label_style),
    ];

    let footer = Paragraph::new(Line::from(hints)).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::StatusChange;
    use std::time::Duration;

    fn line_text(line: &Line) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn test_markdown_bold() {
        let line = parse_markdown_line("rates are **fixed** for now");
        assert_eq!(line.spans.len(), 3);
        assert_eq!(line.spans[1].content, "fixed");
        assert!(line.spans[1].style.add_modifier.contains(Modifier::BOLD));
        assert_eq!(line_text(&line), "rates are fixed for now");
    }

    #[test]
    fn test_markdown_unclosed_is_literal() {
        let line = parse_markdown_line("a **b");
        assert_eq!(line_text(&line), "a **b");
    }

    #[test]
    fn test_connection_label_retry_countdown() {
        let now = Instant::now();
        let mut view = ChatView::default();
        view.connection.state = ConnectionState::Closed("dropped".to_string());
        view.connection.last_status = Some(StatusChange::Disconnected {
            retry_in: Some(Duration::from_secs(2)),
            attempt: 2,
        });
        view.connection.attempt = 2;
        view.connection.max_attempts = 5;
        view.connection.retry_at = Some(now + Duration::from_millis(1500));

        let (label, color) = connection_label(&view, now);
        assert_eq!(label, "○ Disconnected, retry 2/5 in 2s");
        assert_eq!(color, Color::Yellow);
    }

    #[test]
    fn test_connection_label_errored_and_http() {
        let mut view = ChatView::default();
        view.connection.state = ConnectionState::Errored;
        let (label, color) = connection_label(&view, Instant::now());
        assert!(label.contains("Ctrl-R"));
        assert_eq!(color, Color::Red);

        view.transport = TransportMode::Http;
        let (label, _) = connection_label(&view, Instant::now());
        assert_eq!(label, "● HTTP");
    }
}
