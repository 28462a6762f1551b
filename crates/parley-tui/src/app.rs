use parley_core::{AudioStatus, BotStatus, ChatView, Role, UserInput};

/// Lines a chunk of text occupies once wrapped to `width` columns
pub fn wrapped_line_count(text: &str, width: usize) -> usize {
    let width = width.max(1);
    text.lines()
        .map(|line| {
            // Character count, not byte length, for UTF-8 input
            let char_count = line.chars().count();
            if char_count == 0 {
                1
            } else {
                (char_count + width - 1) / width
            }
        })
        .sum::<usize>()
        .max(1)
}

pub struct App {
    pub should_quit: bool,

    /// Latest snapshot published by the controller
    pub view: ChatView,

    pub input: String,
    /// Cursor position in characters
    pub cursor: usize,

    pub scroll: u16,
    /// Keep the newest message in view as the conversation grows
    pub follow: bool,
    pub chat_width: u16,
    pub chat_height: u16,

    pub animation_frame: u8,
    /// One-line message from the front-end itself, e.g. an unreadable recording
    pub notice: Option<String>,

    outbox: Vec<UserInput>,
}

impl App {
    pub fn new(view: ChatView) -> Self {
        Self {
            should_quit: false,
            view,
            input: String::new(),
            cursor: 0,
            scroll: 0,
            follow: true,
            chat_width: 0,
            chat_height: 0,
            animation_frame: 0,
            notice: None,
            outbox: Vec::new(),
        }
    }

    pub fn update_view(&mut self, view: ChatView) {
        self.view = view;
        if self.follow {
            self.scroll_to_bottom();
        }
    }

    /// Queue something for the controller
    pub fn dispatch(&mut self, input: UserInput) {
        self.outbox.push(input);
    }

    pub fn take_outbox(&mut self) -> Vec<UserInput> {
        std::mem::take(&mut self.outbox)
    }

    pub fn is_busy(&self) -> bool {
        self.view.bot_status != BotStatus::Idle
    }

    pub fn tick_animation(&mut self) {
        if self.is_busy() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    /// Total rendered height of the chat pane
    pub fn content_lines(&self) -> usize {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total: usize = 0;
        for msg in &self.view.messages {
            if msg.role != Role::System {
                total += 1; // "You:" / "AI:"
            }
            total += wrapped_line_count(&msg.content, width);
            if self.view.audio.contains_key(&msg.order) {
                total += 1;
            }
            total += 1; // blank line after message
        }

        match &self.view.streaming {
            Some(text) => total += 1 + wrapped_line_count(text, width),
            None if self.view.bot_status == BotStatus::Thinking => total += 2,
            None => {}
        }

        total
    }

    fn max_scroll(&self) -> u16 {
        let visible_height = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };
        let overflow = self.content_lines().saturating_sub(visible_height as usize);
        // Paragraph scroll offsets are u16
        u16::try_from(overflow).unwrap_or(u16::MAX)
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = self.max_scroll();
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.scroll = self.scroll.saturating_sub(lines);
        self.follow = false;
    }

    pub fn scroll_down(&mut self, lines: u16) {
        let max = self.max_scroll();
        self.scroll = self.scroll.saturating_add(lines).min(max);
        self.follow = self.scroll >= max;
    }

    /// Audio note for a message, if it has a clip
    pub fn audio_status(&self, order: u64) -> Option<&AudioStatus> {
        self.view.audio.get(&order)
    }

    pub fn clear_input(&mut self) {
        self.input.clear();
        self.cursor = 0;
    }
}
