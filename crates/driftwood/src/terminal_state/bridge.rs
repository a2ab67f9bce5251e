//! Owns the VT engine instance and the primary/alternate screen buffers.
//!
//! All mutation funnels through `&mut self`; callers share the bridge behind
//! one mutex, which is the serialized access domain for the engine and its
//! grids. `snapshot` clones the active buffer so readers never observe a
//! half-applied feed.

use tracing::trace;

use crate::model::Cell;
use crate::terminal_state::engine::{
    CellSource, DamageRegion, EngineListener, PropertyChange, VtEngine,
};
use crate::terminal_state::grid::Grid;
use crate::terminal_state::scrollback::Scrollback;

pub struct TerminalStateBridge {
    engine: Box<dyn VtEngine>,
    state: BridgeState,
}

struct BridgeState {
    primary: Grid,
    alternate: Grid,
    alt_active: bool,
    scrollback: Scrollback,
    bracketed_paste: bool,
    events: Vec<PropertyChange>,
    outbound: Vec<u8>,
}

impl BridgeState {
    fn active_grid(&self) -> &Grid {
        if self.alt_active {
            &self.alternate
        } else {
            &self.primary
        }
    }

    fn active_grid_mut(&mut self) -> &mut Grid {
        if self.alt_active {
            &mut self.alternate
        } else {
            &mut self.primary
        }
    }
}

impl EngineListener for BridgeState {
    fn repaint(&mut self, cells: &dyn CellSource, region: DamageRegion) {
        let grid = self.active_grid_mut();
        let bottom = region.bottom.min(grid.rows);
        let right = region.right.min(grid.cols);
        for row in region.top..bottom {
            for col in region.left..right {
                grid.set_cell(row, col, cells.cell_at(row, col));
            }
        }
    }

    fn move_region(&mut self, src_top: u16, src_bottom: u16, dest_top: u16) {
        let grid = self.active_grid_mut();
        let src_bottom = src_bottom.min(grid.rows);
        if src_top >= src_bottom || dest_top >= grid.rows {
            return;
        }
        let moved: Vec<Vec<Cell>> = (src_top..src_bottom)
            .filter_map(|row| grid.row_cells(row).map(<[Cell]>::to_vec))
            .collect();
        for (offset, row) in moved.into_iter().enumerate() {
            let dest = dest_top as usize + offset;
            if dest >= grid.rows as usize {
                break;
            }
            for (col, cell) in row.into_iter().enumerate() {
                grid.set_cell(dest as u16, col as u16, cell);
            }
        }
    }

    fn rows_scrolled_out(&mut self, rows: Vec<Vec<Cell>>) {
        if self.alt_active {
            return;
        }
        let cols = self.primary.cols;
        for row in rows {
            self.scrollback.push(row, cols);
        }
    }

    fn cursor_moved(&mut self, row: u16, col: u16) {
        let grid = self.active_grid_mut();
        grid.cursor.row = row.min(grid.rows.saturating_sub(1));
        grid.cursor.col = col.min(grid.cols.saturating_sub(1));
    }

    fn property_changed(&mut self, change: PropertyChange) {
        match &change {
            PropertyChange::AlternateScreen(active) => {
                self.alt_active = *active;
                trace!(target = "terminal_state", alternate = *active, "screen switched");
            }
            PropertyChange::CursorVisible(visible) => {
                self.primary.cursor.visible = *visible;
                self.alternate.cursor.visible = *visible;
            }
            PropertyChange::BracketedPaste(enabled) => {
                self.bracketed_paste = *enabled;
            }
            PropertyChange::Title(_) => {}
        }
        self.events.push(change);
    }

    fn transmit(&mut self, bytes: Vec<u8>) {
        self.outbound.extend(bytes);
    }
}

impl TerminalStateBridge {
    pub fn new(engine: Box<dyn VtEngine>, rows: u16, cols: u16, scrollback_capacity: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        let mut alternate = Grid::new(rows, cols);
        alternate.alternate = true;
        TerminalStateBridge {
            engine,
            state: BridgeState {
                primary: Grid::new(rows, cols),
                alternate,
                alt_active: false,
                scrollback: Scrollback::new(scrollback_capacity),
                bracketed_paste: false,
                events: Vec::new(),
                outbound: Vec::new(),
            },
        }
    }

    /// Pushes bytes into the engine and applies every resulting mutation.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.engine.feed(bytes, &mut self.state);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        // Reshape the buffers first so the engine's repaint during resize
        // lands inside the new bounds.
        self.state.primary.resize(rows, cols);
        self.state.alternate.resize(rows, cols);
        self.state.scrollback.set_cols(cols);
        self.engine.resize(rows, cols, &mut self.state);
    }

    /// Clone of the active buffer; safe to call from any thread holding the
    /// bridge lock.
    pub fn snapshot(&self) -> Grid {
        self.state.active_grid().clone()
    }

    pub fn alt_active(&self) -> bool {
        self.state.alt_active
    }

    pub fn bracketed_paste(&self) -> bool {
        self.state.bracketed_paste
    }

    pub fn rows(&self) -> u16 {
        self.state.active_grid().rows
    }

    pub fn cols(&self) -> u16 {
        self.state.active_grid().cols
    }

    pub fn scrollback_len(&self) -> usize {
        self.state.scrollback.len()
    }

    /// Property transitions accumulated since the last call.
    pub fn take_events(&mut self) -> Vec<PropertyChange> {
        std::mem::take(&mut self.state.events)
    }

    /// Engine-generated reply bytes destined for the child.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.state.outbound)
    }

    /// Absolute index of the first line still addressable in the combined
    /// buffer. Only ever increases.
    pub fn base_offset(&self) -> u64 {
        self.state.scrollback.evicted()
    }

    /// One past the last combined-buffer line.
    pub fn combined_end(&self) -> u64 {
        self.base_offset()
            + self.state.scrollback.len() as u64
            + self.state.active_grid().rows as u64
    }

    /// Lines currently addressable (scrollback plus visible rows).
    pub fn combined_len(&self) -> usize {
        self.state.scrollback.len() + self.state.active_grid().rows as usize
    }

    /// Absolute combined-buffer index of the cursor's row.
    pub fn absolute_cursor_line(&self) -> u64 {
        self.base_offset()
            + self.state.scrollback.len() as u64
            + self.state.active_grid().cursor.row as u64
    }

    /// Cells of the combined-buffer line at an absolute index, or `None` if
    /// it was evicted or does not exist yet.
    pub fn combined_row(&self, index: u64) -> Option<Vec<Cell>> {
        let base = self.base_offset();
        if index < base {
            return None;
        }
        let offset = (index - base) as usize;
        let in_history = self.state.scrollback.len();
        if offset < in_history {
            return self.state.scrollback.row(offset).map(<[Cell]>::to_vec);
        }
        let grid_row = offset - in_history;
        if grid_row >= self.state.active_grid().rows as usize {
            return None;
        }
        self.state
            .active_grid()
            .row_cells(grid_row as u16)
            .map(<[Cell]>::to_vec)
    }

    /// Text of the combined-buffer line at an absolute index.
    pub fn combined_text(&self, index: u64) -> Option<String> {
        self.combined_row(index)
            .map(|cells| cells.iter().map(|cell| cell.glyph.as_str()).collect())
    }

    /// The `count` rows ending `offset` rows above the bottom of the
    /// combined buffer, top-down: the viewport a renderer draws.
    pub fn view_rows(&self, offset: usize, count: usize) -> Vec<Vec<Cell>> {
        let end = self.combined_end().saturating_sub(offset as u64);
        let start = end.saturating_sub(count as u64).max(self.base_offset());
        (start..end).filter_map(|idx| self.combined_row(idx)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CellStyle;

    /// Scripted engine so bridge behavior is testable without a VT stack.
    struct ScriptedEngine {
        rows: u16,
        cols: u16,
        script: Vec<ScriptStep>,
    }

    enum ScriptStep {
        Paint(u16, u16, &'static str),
        ScrollOut(Vec<&'static str>),
        Cursor(u16, u16),
        Property(PropertyChange),
        Transmit(&'static [u8]),
        Move(u16, u16, u16),
    }

    struct OneCell {
        cell: Cell,
    }

    impl CellSource for OneCell {
        fn cell_at(&self, _row: u16, _col: u16) -> Cell {
            self.cell.clone()
        }
    }

    impl VtEngine for ScriptedEngine {
        fn feed(&mut self, _bytes: &[u8], listener: &mut dyn EngineListener) {
            for step in self.script.drain(..) {
                match step {
                    ScriptStep::Paint(row, col, glyph) => {
                        let source = OneCell {
                            cell: Cell::new(glyph, CellStyle::default()),
                        };
                        listener.repaint(
                            &source,
                            DamageRegion {
                                top: row,
                                bottom: row + 1,
                                left: col,
                                right: col + 1,
                            },
                        );
                    }
                    ScriptStep::ScrollOut(rows) => {
                        let rows = rows
                            .into_iter()
                            .map(|text| vec![Cell::new(text, CellStyle::default())])
                            .collect();
                        listener.rows_scrolled_out(rows);
                    }
                    ScriptStep::Cursor(row, col) => listener.cursor_moved(row, col),
                    ScriptStep::Property(change) => listener.property_changed(change),
                    ScriptStep::Transmit(bytes) => listener.transmit(bytes.to_vec()),
                    ScriptStep::Move(src_top, src_bottom, dest_top) => {
                        listener.move_region(src_top, src_bottom, dest_top)
                    }
                }
            }
        }

        fn resize(&mut self, rows: u16, cols: u16, _listener: &mut dyn EngineListener) {
            self.rows = rows;
            self.cols = cols;
        }

        fn rows(&self) -> u16 {
            self.rows
        }

        fn cols(&self) -> u16 {
            self.cols
        }
    }

    fn bridge_with(script: Vec<ScriptStep>) -> TerminalStateBridge {
        let engine = ScriptedEngine {
            rows: 4,
            cols: 8,
            script,
        };
        TerminalStateBridge::new(Box::new(engine), 4, 8, 16)
    }

    #[test]
    fn repaint_lands_in_the_primary_buffer() {
        let mut bridge = bridge_with(vec![ScriptStep::Paint(1, 3, "z")]);
        bridge.feed(b"");
        assert_eq!(bridge.snapshot().cell(1, 3).unwrap().glyph, "z");
    }

    #[test]
    fn alternate_toggle_switches_the_active_buffer() {
        let mut bridge = bridge_with(vec![
            ScriptStep::Paint(0, 0, "p"),
            ScriptStep::Property(PropertyChange::AlternateScreen(true)),
            ScriptStep::Paint(0, 0, "a"),
        ]);
        bridge.feed(b"");
        assert!(bridge.alt_active());
        let snapshot = bridge.snapshot();
        assert!(snapshot.alternate);
        assert_eq!(snapshot.cell(0, 0).unwrap().glyph, "a");

        let mut back = bridge_with(vec![ScriptStep::Property(PropertyChange::AlternateScreen(
            false,
        ))]);
        back.feed(b"");
        assert!(!back.alt_active());
    }

    #[test]
    fn scrolled_rows_accumulate_and_base_only_grows() {
        // Capacity 16, 20 rows scrolled out: the four oldest are evicted.
        let mut bridge = bridge_with(vec![ScriptStep::ScrollOut(vec!["r"; 20])]);
        bridge.feed(b"");
        assert_eq!(bridge.scrollback_len(), 16);
        assert_eq!(bridge.base_offset(), 4);
        assert_eq!(bridge.combined_end(), 4 + 16 + 4);
    }

    #[test]
    fn move_region_block_copies_rows() {
        let mut bridge = bridge_with(vec![
            ScriptStep::Paint(0, 0, "m"),
            ScriptStep::Move(0, 1, 2),
        ]);
        bridge.feed(b"");
        let snapshot = bridge.snapshot();
        assert_eq!(snapshot.cell(2, 0).unwrap().glyph, "m");
        assert_eq!(snapshot.cell(0, 0).unwrap().glyph, "m");
    }

    #[test]
    fn transmit_bytes_are_collected_for_the_child() {
        let mut bridge = bridge_with(vec![ScriptStep::Transmit(b"\x1b[0n")]);
        bridge.feed(b"");
        assert_eq!(bridge.take_outbound(), b"\x1b[0n".to_vec());
        assert!(bridge.take_outbound().is_empty());
    }

    #[test]
    fn combined_rows_address_history_then_grid() {
        let mut bridge = bridge_with(vec![
            ScriptStep::ScrollOut(vec!["old"]),
            ScriptStep::Paint(0, 0, "n"),
        ]);
        bridge.feed(b"");
        assert_eq!(bridge.combined_text(0).unwrap().trim_end(), "old");
        assert!(bridge.combined_text(1).unwrap().starts_with('n'));
        assert_eq!(bridge.combined_text(bridge.combined_end()), None);
    }

    #[test]
    fn cursor_updates_are_clamped_to_the_grid() {
        let mut bridge = bridge_with(vec![ScriptStep::Cursor(9, 9)]);
        bridge.feed(b"");
        let cursor = bridge.snapshot().cursor;
        assert_eq!((cursor.row, cursor.col), (3, 7));
    }
}
