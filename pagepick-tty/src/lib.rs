use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{Clear, ClearType},
};
use pagepick_core::{Command, PageIndex, RasterBuffer};
use png::{BitDepth, ColorType, Encoder};

pub struct KittyRenderer<W: Write> {
    writer: W,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` and places it at the current cursor position. Each
    /// distinct `image_id` owns one placement, so the active view and every
    /// rail slot can be redrawn independently.
    pub fn draw(&mut self, image: &RasterBuffer, params: DrawParams, image_id: u32) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    image_id,
                    image_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    if more { 1 } else { 0 }
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", if more { 1 } else { 0 })?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Deletes every transmitted image and placement.
    pub fn delete_images(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=A,q=2\u{1b}\\")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(&mut self.writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        Ok(())
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

/// Scroll window over the filtered page list. Keeps the active page visible
/// with nearest placement: the offset moves only as far as needed to bring
/// the active entry to the closest window edge.
#[derive(Debug, Default)]
pub struct ThumbnailRail {
    scroll_offset: usize,
}

impl ThumbnailRail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scroll_offset(&self) -> usize {
        self.scroll_offset
    }

    pub fn window<'a>(
        &mut self,
        visible: &'a [PageIndex],
        active: PageIndex,
        slots: usize,
    ) -> &'a [PageIndex] {
        if slots == 0 || visible.is_empty() {
            self.scroll_offset = 0;
            return &[];
        }

        let max_offset = visible.len().saturating_sub(slots);
        if self.scroll_offset > max_offset {
            self.scroll_offset = max_offset;
        }

        if let Some(pos) = visible.iter().position(|&page| page == active) {
            if pos < self.scroll_offset {
                self.scroll_offset = pos;
            } else if pos >= self.scroll_offset + slots {
                self.scroll_offset = pos + 1 - slots;
            }
        }

        let end = (self.scroll_offset + slots).min(visible.len());
        &visible[self.scroll_offset..end]
    }
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    ToggleActive,
    BeginSearch,
    SearchQueryChanged { query: String },
    SearchSubmit { query: String },
    SearchCancel,
    Confirm,
    Cancel,
    Resized,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Search,
}

#[derive(Default)]
pub struct EventMapper {
    mode: InputMode,
    search_buffer: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if mode != InputMode::Search {
            self.search_buffer.clear();
        }
        self.mode = mode;
    }

    pub fn pending_input(&self) -> Option<String> {
        if matches!(self.mode, InputMode::Search) {
            return Some(format!("/{}", self.search_buffer));
        }
        None
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        if let Event::Resize(_, _) = event {
            return UiEvent::Resized;
        }
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Search => self.map_event_search(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Right, KeyModifiers::NONE)
                | (KeyCode::Down, KeyModifiers::NONE)
                | (KeyCode::Char('l'), KeyModifiers::NONE)
                | (KeyCode::Char('j'), KeyModifiers::NONE) => UiEvent::Command(Command::NextPage),
                (KeyCode::Left, KeyModifiers::NONE)
                | (KeyCode::Up, KeyModifiers::NONE)
                | (KeyCode::Char('h'), KeyModifiers::NONE)
                | (KeyCode::Char('k'), KeyModifiers::NONE) => UiEvent::Command(Command::PrevPage),
                (KeyCode::Home, _) | (KeyCode::Char('g'), KeyModifiers::NONE) => {
                    UiEvent::Command(Command::GotoPage { page: 1 })
                }
                (KeyCode::End, _) | (KeyCode::Char('G'), KeyModifiers::SHIFT) => {
                    UiEvent::Command(Command::GotoPage { page: usize::MAX })
                }
                (KeyCode::Char(' '), _) => UiEvent::ToggleActive,
                (KeyCode::Char('c'), KeyModifiers::NONE) => {
                    UiEvent::Command(Command::ClearSelection)
                }
                (KeyCode::Char('/'), KeyModifiers::NONE) => {
                    self.mode = InputMode::Search;
                    self.search_buffer.clear();
                    UiEvent::BeginSearch
                }
                (KeyCode::Enter, _) => UiEvent::Confirm,
                (KeyCode::Esc, _) | (KeyCode::Char('q'), _) => UiEvent::Cancel,
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_search(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) => {
                    self.set_mode(InputMode::Normal);
                    UiEvent::SearchCancel
                }
                (KeyCode::Enter, _) => {
                    let query = self.search_buffer.clone();
                    self.set_mode(InputMode::Normal);
                    UiEvent::SearchSubmit { query }
                }
                (KeyCode::Backspace, _) => {
                    self.search_buffer.pop();
                    UiEvent::SearchQueryChanged {
                        query: self.search_buffer.clone(),
                    }
                }
                (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                    self.search_buffer.push(c);
                    UiEvent::SearchQueryChanged {
                        query: self.search_buffer.clone(),
                    }
                }
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }
}
