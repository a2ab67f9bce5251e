//! Adapter implementing [`VtEngine`] over `alacritty_terminal`.

use std::sync::{Arc, Mutex};

use alacritty_terminal::{
    Term,
    event::{Event, EventListener},
    grid::Dimensions,
    index::{Column, Line, Point},
    term::{
        Config, TermMode,
        cell::{Cell as AlacrittyCell, Flags as CellFlags},
    },
    vte::ansi::{Color as AnsiColor, NamedColor, Processor},
};
use tracing::trace;

use crate::model::{Cell, CellAttributes, CellStyle, Color};
use crate::terminal_state::engine::{
    CellSource, DamageRegion, EngineListener, PropertyChange, VtEngine,
};

struct TermDimensions {
    columns: usize,
    screen_lines: usize,
}

impl TermDimensions {
    fn new(columns: usize, screen_lines: usize) -> Self {
        Self {
            columns,
            screen_lines,
        }
    }
}

impl Dimensions for TermDimensions {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

/// Collects the engine events we care about; everything else (wakeups,
/// bells) is dropped.
#[derive(Clone)]
struct EventProxy {
    queue: Arc<Mutex<Vec<Event>>>,
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        match event {
            Event::Title(_) | Event::ResetTitle | Event::PtyWrite(_) => {
                self.queue.lock().unwrap().push(event);
            }
            _ => {}
        }
    }
}

pub struct AlacrittyEngine {
    term: Term<EventProxy>,
    parser: Processor,
    events: Arc<Mutex<Vec<Event>>>,
    rows: u16,
    cols: u16,
    last_cursor: (u16, u16),
    last_alternate: bool,
    last_cursor_visible: bool,
    last_bracketed_paste: bool,
}

unsafe impl Send for AlacrittyEngine {}

impl AlacrittyEngine {
    pub fn new(rows: u16, cols: u16, history_limit: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        let queue = Arc::new(Mutex::new(Vec::new()));
        let proxy = EventProxy {
            queue: queue.clone(),
        };
        let config = Config {
            scrolling_history: history_limit,
            ..Config::default()
        };
        let dimensions = TermDimensions::new(cols as usize, rows as usize);
        let mut term = Term::new(config, &dimensions, proxy);
        let mut parser = Processor::new();
        // Standard LF behavior so a bare \n also returns the carriage.
        for byte in b"\x1b[20h" {
            parser.advance(&mut term, *byte);
        }
        term.reset_damage();
        Self {
            term,
            parser,
            events: queue,
            rows,
            cols,
            last_cursor: (0, 0),
            last_alternate: false,
            last_cursor_visible: true,
            last_bracketed_paste: false,
        }
    }

    fn drain_scrolled_rows(&mut self, listener: &mut dyn EngineListener) {
        if self.term.mode().contains(TermMode::ALT_SCREEN) {
            return;
        }
        let rows = {
            let grid = self.term.grid();
            let history = grid.total_lines().saturating_sub(grid.screen_lines());
            if history == 0 {
                return;
            }
            let cols = grid.columns();
            let mut rows = Vec::with_capacity(history);
            for offset in (1..=history).rev() {
                let line = Line(-(offset as i32));
                let mut cells = Vec::with_capacity(cols);
                for col in 0..cols {
                    cells.push(convert_cell(&grid[Point::new(line, Column(col))]));
                }
                rows.push(cells);
            }
            rows
        };
        trace!(target = "terminal_state", count = rows.len(), "rows scrolled out");
        listener.rows_scrolled_out(rows);
        // The ring owns history; drop the engine's saved lines so eviction
        // accounting stays exact.
        for byte in b"\x1b[3J" {
            self.parser.advance(&mut self.term, *byte);
        }
    }

    fn sync_properties(&mut self, listener: &mut dyn EngineListener) {
        let mode = *self.term.mode();

        let alternate = mode.contains(TermMode::ALT_SCREEN);
        if alternate != self.last_alternate {
            self.last_alternate = alternate;
            listener.property_changed(PropertyChange::AlternateScreen(alternate));
        }

        let cursor_visible = mode.contains(TermMode::SHOW_CURSOR);
        if cursor_visible != self.last_cursor_visible {
            self.last_cursor_visible = cursor_visible;
            listener.property_changed(PropertyChange::CursorVisible(cursor_visible));
        }

        let bracketed = mode.contains(TermMode::BRACKETED_PASTE);
        if bracketed != self.last_bracketed_paste {
            self.last_bracketed_paste = bracketed;
            listener.property_changed(PropertyChange::BracketedPaste(bracketed));
        }
    }

    fn drain_events(&mut self, listener: &mut dyn EngineListener) {
        let events: Vec<Event> = std::mem::take(&mut *self.events.lock().unwrap());
        for event in events {
            match event {
                Event::Title(title) => {
                    listener.property_changed(PropertyChange::Title(title));
                }
                Event::ResetTitle => {
                    listener.property_changed(PropertyChange::Title(String::new()));
                }
                Event::PtyWrite(reply) => {
                    listener.transmit(reply.into_bytes());
                }
                _ => {}
            }
        }
    }

    fn repaint_viewport(&self, listener: &mut dyn EngineListener) {
        let source = TermCells { term: &self.term };
        listener.repaint(&source, DamageRegion::full(self.rows, self.cols));
    }

    fn sync_cursor(&mut self, listener: &mut dyn EngineListener, force: bool) {
        let point = self.term.grid().cursor.point;
        let row = point.line.0.max(0) as u16;
        let col = point.column.0.min(u16::MAX as usize) as u16;
        if force || (row, col) != self.last_cursor {
            self.last_cursor = (row, col);
            listener.cursor_moved(row, col);
        }
    }
}

impl VtEngine for AlacrittyEngine {
    fn feed(&mut self, bytes: &[u8], listener: &mut dyn EngineListener) {
        for byte in bytes {
            self.parser.advance(&mut self.term, *byte);
        }
        self.drain_scrolled_rows(listener);
        self.sync_properties(listener);
        self.drain_events(listener);
        self.repaint_viewport(listener);
        self.sync_cursor(listener, false);
        self.term.reset_damage();
    }

    fn resize(&mut self, rows: u16, cols: u16, listener: &mut dyn EngineListener) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        if (rows, cols) == (self.rows, self.cols) {
            return;
        }
        self.term
            .resize(TermDimensions::new(cols as usize, rows as usize));
        self.rows = rows;
        self.cols = cols;
        // Shrinking pushes top rows into the engine's saved lines; hand them
        // to the ring before repainting the smaller viewport.
        self.drain_scrolled_rows(listener);
        self.repaint_viewport(listener);
        self.sync_cursor(listener, true);
        self.term.reset_damage();
    }

    fn rows(&self) -> u16 {
        self.rows
    }

    fn cols(&self) -> u16 {
        self.cols
    }
}

struct TermCells<'a> {
    term: &'a Term<EventProxy>,
}

impl CellSource for TermCells<'_> {
    fn cell_at(&self, row: u16, col: u16) -> Cell {
        let grid = self.term.grid();
        if row as usize >= grid.screen_lines() || col as usize >= grid.columns() {
            return Cell::default();
        }
        convert_cell(&grid[Point::new(Line(row as i32), Column(col as usize))])
    }
}

fn convert_cell(cell: &AlacrittyCell) -> Cell {
    let style = CellStyle {
        fg_color: convert_color(&cell.fg),
        bg_color: convert_color(&cell.bg),
        attributes: convert_attributes(cell.flags),
    };
    if cell
        .flags
        .intersects(CellFlags::WIDE_CHAR_SPACER | CellFlags::LEADING_WIDE_CHAR_SPACER)
    {
        return Cell::spacer(style);
    }
    let mut glyph = String::new();
    glyph.push(cell.c);
    if let Some(zerowidth) = cell.zerowidth() {
        glyph.extend(zerowidth.iter());
    }
    let width = if cell.flags.contains(CellFlags::WIDE_CHAR) {
        2
    } else {
        1
    };
    Cell::with_width(glyph, width, style)
}

fn convert_color(color: &AnsiColor) -> Color {
    match color {
        AnsiColor::Spec(rgb) => Color::Rgb(rgb.r, rgb.g, rgb.b),
        AnsiColor::Indexed(index) => Color::Indexed(*index),
        AnsiColor::Named(name) => match name {
            NamedColor::Foreground
            | NamedColor::BrightForeground
            | NamedColor::DimForeground
            | NamedColor::Background
            | NamedColor::Cursor => Color::Default,
            other => {
                let value = *other as usize;
                if value <= u8::MAX as usize {
                    Color::Indexed(value as u8)
                } else {
                    Color::Default
                }
            }
        },
    }
}

fn convert_attributes(flags: CellFlags) -> CellAttributes {
    CellAttributes {
        bold: flags.contains(CellFlags::BOLD)
            || flags.contains(CellFlags::DIM_BOLD)
            || flags.contains(CellFlags::BOLD_ITALIC),
        italic: flags.contains(CellFlags::ITALIC) || flags.contains(CellFlags::BOLD_ITALIC),
        underline: flags.intersects(CellFlags::ALL_UNDERLINES),
        strikethrough: flags.contains(CellFlags::STRIKEOUT),
        reverse: flags.contains(CellFlags::INVERSE),
        blink: false,
        dim: flags.contains(CellFlags::DIM) || flags.contains(CellFlags::DIM_BOLD),
        hidden: flags.contains(CellFlags::HIDDEN),
    }
}
