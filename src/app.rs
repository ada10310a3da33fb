use std::time::Instant;

use ratatui::layout::Rect;

use crate::session::{Session, SessionError, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,
    pub session: Session,

    // Input state
    pub input: String,
    pub cursor: usize, // cursor position in input, in chars

    // Blocking alert, dismissed with Enter or Esc
    pub alert: Option<String>,

    // Chat view state
    pub chat_scroll: u16,
    pub chat_height: u16, // Height of chat area for scroll calculations
    pub chat_width: u16,  // Width of chat area for wrap calculations
    pub follow_tail: bool,
    rendered_len: usize,
    rendered_busy: bool,

    // Chat area for mouse hit-testing (updated during render)
    pub chat_area: Option<Rect>,

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation
}

impl App {
    pub fn new(session: Session) -> Self {
        Self {
            should_quit: false,
            input_mode: InputMode::Editing,
            session,

            input: String::new(),
            cursor: 0,

            alert: None,

            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,
            follow_tail: true,
            rendered_len: 0,
            rendered_busy: false,

            chat_area: None,

            animation_frame: 0,
        }
    }

    /// Send the input buffer as the next user message.
    ///
    /// The buffer is only cleared when the session accepts the message.
    pub fn submit_input(&mut self) {
        if self.input.trim().is_empty() {
            return;
        }

        match self.session.send_message(self.input.clone()) {
            Ok(()) => {
                self.input.clear();
                self.cursor = 0;
                self.follow_tail = true;
                self.sync_scroll();
            }
            Err(SessionError::NotReady) => {
                self.alert = Some(SessionError::NotReady.to_string());
            }
            Err(SessionError::Busy) => {
                self.session.notify(SessionError::Busy.to_string());
            }
        }
    }

    pub fn apply_session_event(&mut self, event: SessionEvent) {
        self.session.apply(event);
        self.sync_scroll();
    }

    /// Tick animation frame and expire notices (called by Tick event)
    pub fn tick(&mut self, now: Instant) {
        if self.session.is_busy() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
        self.session.clear_expired_notice(now);
    }

    pub fn dismiss_alert(&mut self) -> bool {
        self.alert.take().is_some()
    }

    // Chat scrolling
    pub fn scroll_up(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_sub(lines);
        self.follow_tail = false;
    }

    pub fn scroll_down(&mut self, lines: u16) {
        let max_scroll = self.max_scroll();
        self.chat_scroll = self.chat_scroll.saturating_add(lines).min(max_scroll);
        self.follow_tail = self.chat_scroll >= max_scroll;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.chat_scroll = self.max_scroll();
        self.follow_tail = true;
    }

    /// Re-pin the view to the newest message when the transcript grew or a
    /// reply started, unless the user scrolled away.
    pub fn sync_scroll(&mut self) {
        let len = self.session.transcript().visible_len();
        let busy = self.session.is_busy();
        let changed = len != self.rendered_len || busy != self.rendered_busy;
        self.rendered_len = len;
        self.rendered_busy = busy;

        if changed && len > 0 {
            self.follow_tail = true;
        }
        if self.follow_tail {
            self.chat_scroll = self.max_scroll();
        }
    }

    fn max_scroll(&self) -> u16 {
        let visible_height = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };
        self.total_chat_lines().saturating_sub(visible_height)
    }

    /// Number of wrapped lines the chat pane needs for the current transcript
    pub fn total_chat_lines(&self) -> u16 {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total_lines: u16 = 0;

        for msg in self.session.transcript().visible() {
            total_lines = total_lines.saturating_add(1); // Role line ("You:" or "AI:")
            total_lines = total_lines.saturating_add(wrapped_lines(&msg.content, wrap_width));
            total_lines = total_lines.saturating_add(1); // Blank line after message
        }

        if self.session.is_busy() {
            total_lines = total_lines.saturating_add(2); // "AI:" + "Thinking..."
        }
        if let Some(error) = self.session.last_error() {
            total_lines = total_lines.saturating_add(wrapped_lines(&format!("Error: {}", error), wrap_width));
        }

        total_lines
    }
}

fn wrapped_lines(text: &str, wrap_width: usize) -> u16 {
    let wrap_width = wrap_width.max(1);
    let mut lines: u16 = 0;
    for line in text.lines() {
        // Use character count, not byte length, for proper UTF-8 handling
        let char_count = line.chars().count();
        if char_count == 0 {
            lines = lines.saturating_add(1); // Empty line still takes one line
        } else {
            lines = lines.saturating_add(char_count.div_ceil(wrap_width) as u16);
        }
    }
    lines.max(1)
}
