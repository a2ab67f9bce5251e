//! Streaming segmentation of the output stream into command blocks.

use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, trace};

use crate::blocks::marker::{MarkerParse, find_prefix, parse_marker, partial_prefix_len};
use crate::model::{Block, BlockId, BlockStatus};

/// Whether output is being segmented into blocks or passed through raw
/// (a full-screen program owns the terminal).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayMode {
    Blocks,
    Raw,
}

/// Staged when a marker completes; consumed exactly once by the session to
/// slice the block's stdout out of the combined buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingFinalization {
    pub block_id: BlockId,
    pub exit_code: i32,
    pub output_start: u64,
    pub command: String,
}

struct DetectorState {
    pending: Vec<u8>,
    active: Option<Block>,
    /// Raw bytes captured for the active block, before any rendering.
    raw_capture: String,
    completed: Vec<Block>,
    staged: Option<PendingFinalization>,
    mode: DisplayMode,
    next_id: BlockId,
}

impl DetectorState {
    fn flush_output(&mut self, count: usize) {
        let bytes: Vec<u8> = self.pending.drain(..count).collect();
        if self.active.is_some() {
            self.raw_capture
                .push_str(&String::from_utf8_lossy(&bytes));
        }
    }

    fn stage(&mut self, exit_code: i32) {
        if self.staged.is_some() {
            trace!(target = "blocks", exit_code, "marker ignored, one already staged");
            return;
        }
        let Some(active) = self.active.as_ref() else {
            trace!(target = "blocks", exit_code, "marker ignored, no active block");
            return;
        };
        self.staged = Some(PendingFinalization {
            block_id: active.id,
            exit_code,
            output_start: active.output_start,
            command: active.command.clone(),
        });
    }
}

/// All state behind one mutex; no public operation holds it across calls
/// into other components.
pub struct BlockDetector {
    state: Mutex<DetectorState>,
}

impl Default for BlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDetector {
    pub fn new() -> Self {
        BlockDetector {
            state: Mutex::new(DetectorState {
                pending: Vec::new(),
                active: None,
                raw_capture: String::new(),
                completed: Vec::new(),
                staged: None,
                mode: DisplayMode::Blocks,
                next_id: 0,
            }),
        }
    }

    /// Opens a new block for a submitted command. No-op while another block
    /// is active or while detection is suspended.
    pub fn register_user_input(&self, command: &str, output_start: u64) -> Option<BlockId> {
        let mut state = self.state.lock().unwrap();
        if state.mode == DisplayMode::Raw || state.active.is_some() {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.active = Some(Block::started(id, command, output_start));
        state.raw_capture.clear();
        debug!(target = "blocks", id, command, output_start, "block opened");
        Some(id)
    }

    /// Feeds a chunk of child output through the marker scanner. Never
    /// fails: marker-looking garbage degrades to ordinary output one byte
    /// at a time.
    pub fn process_output(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.mode == DisplayMode::Raw {
            return;
        }
        state.pending.extend_from_slice(bytes);
        loop {
            match find_prefix(&state.pending) {
                None => {
                    let keep = partial_prefix_len(&state.pending);
                    let flush = state.pending.len() - keep;
                    state.flush_output(flush);
                    break;
                }
                Some(0) => match parse_marker(&state.pending) {
                    MarkerParse::Complete {
                        exit_code,
                        consumed,
                    } => {
                        state.pending.drain(..consumed);
                        state.stage(exit_code);
                    }
                    MarkerParse::NeedMore => break,
                    MarkerParse::Invalid => state.flush_output(1),
                },
                Some(position) => state.flush_output(position),
            }
        }
    }

    /// Takes the staged finalization, if any; each request is consumed once.
    pub fn take_pending(&self) -> Option<PendingFinalization> {
        self.state.lock().unwrap().staged.take()
    }

    /// Finalizes the active block with the rendered stdout the session
    /// sliced from the combined buffer.
    pub fn complete_pending_block(&self, exit_code: i32, stdout: String) {
        let mut state = self.state.lock().unwrap();
        let Some(mut block) = state.active.take() else {
            return;
        };
        block.finished_at = Some(Utc::now());
        block.exit_code = Some(exit_code);
        block.status = BlockStatus::from_exit_code(exit_code);
        block.stdout = stdout;
        debug!(target = "blocks", id = block.id, exit_code, status = ?block.status, "block finished");
        state.completed.push(block);
    }

    /// Closes the active block as interrupted (session ending, child gone).
    /// The raw byte capture stands in for stdout since no marker arrived.
    pub fn interrupt_active(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(mut block) = state.active.take() else {
            return;
        };
        block.finished_at = Some(Utc::now());
        block.status = BlockStatus::Interrupted;
        block.stdout = std::mem::take(&mut state.raw_capture);
        debug!(target = "blocks", id = block.id, "block interrupted");
        state.completed.push(block);
        state.staged = None;
    }

    /// Raw passthrough suspends detection entirely: in-flight block, buffer
    /// and staged request are discarded. Returning to block mode resumes.
    pub fn set_display_mode(&self, mode: DisplayMode) {
        let mut state = self.state.lock().unwrap();
        if state.mode == mode {
            return;
        }
        debug!(target = "blocks", ?mode, "display mode changed");
        state.mode = mode;
        if mode == DisplayMode::Raw {
            state.active = None;
            state.pending.clear();
            state.raw_capture.clear();
            state.staged = None;
        }
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.state.lock().unwrap().mode
    }

    pub fn active_block(&self) -> Option<Block> {
        self.state.lock().unwrap().active.clone()
    }

    /// Completed blocks followed by the active one, oldest first.
    pub fn blocks(&self) -> Vec<Block> {
        let state = self.state.lock().unwrap();
        let mut blocks = state.completed.clone();
        blocks.extend(state.active.clone());
        blocks
    }

    /// Raw bytes captured for the active block so far (pre-rendering).
    pub fn raw_capture(&self) -> String {
        self.state.lock().unwrap().raw_capture.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalize_with_capture(detector: &BlockDetector) -> Option<PendingFinalization> {
        let pending = detector.take_pending()?;
        let stdout = detector.raw_capture();
        detector.complete_pending_block(pending.exit_code, stdout);
        Some(pending)
    }

    #[test]
    fn detects_a_whole_marker() {
        let detector = BlockDetector::new();
        detector.register_user_input("echo hi", 0);
        detector.process_output(b"hi\n<<<MARKER>>>:0 ");
        let pending = finalize_with_capture(&detector).expect("marker staged");
        assert_eq!(pending.exit_code, 0);

        let blocks = detector.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].command, "echo hi");
        assert_eq!(blocks[0].stdout, "hi\n");
        assert_eq!(blocks[0].status, BlockStatus::Success);
        assert_eq!(blocks[0].exit_code, Some(0));
    }

    #[test]
    fn split_markers_match_the_unsplit_result() {
        let full = b"fail\n<<<MARKER>>>:1 ";
        for split in 1..full.len() {
            let detector = BlockDetector::new();
            detector.register_user_input("false", 0);
            detector.process_output(&full[..split]);
            detector.process_output(&full[split..]);
            let pending =
                finalize_with_capture(&detector).unwrap_or_else(|| panic!("split {split}"));
            assert_eq!(pending.exit_code, 1, "split at {split}");
            let blocks = detector.blocks();
            assert_eq!(blocks[0].stdout, "fail\n", "split at {split}");
            assert_eq!(blocks[0].status, BlockStatus::Failure, "split at {split}");
        }
    }

    #[test]
    fn every_chunking_of_a_marker_yields_the_same_code() {
        let full = b"x<<<MARKER>>>:-7 y";
        for first in 1..full.len() - 1 {
            for second in first + 1..full.len() {
                let detector = BlockDetector::new();
                detector.register_user_input("cmd", 0);
                detector.process_output(&full[..first]);
                detector.process_output(&full[first..second]);
                detector.process_output(&full[second..]);
                let pending = detector.take_pending().expect("staged");
                assert_eq!(pending.exit_code, -7);
                assert_eq!(detector.raw_capture(), "xy");
            }
        }
    }

    #[test]
    fn at_most_one_block_runs_and_registration_is_a_no_op_meanwhile() {
        let detector = BlockDetector::new();
        let first = detector.register_user_input("one", 0);
        assert!(first.is_some());
        assert!(detector.register_user_input("two", 1).is_none());
        assert_eq!(
            detector
                .blocks()
                .iter()
                .filter(|block| block.is_running())
                .count(),
            1
        );
    }

    #[test]
    fn second_marker_before_consumption_is_ignored() {
        let detector = BlockDetector::new();
        detector.register_user_input("cmd", 0);
        detector.process_output(b"x\n<<<MARKER>>>:0 <<<MARKER>>>:2 ");
        let pending = detector.take_pending().expect("first marker staged");
        assert_eq!(pending.exit_code, 0);
        assert!(detector.take_pending().is_none());
        detector.complete_pending_block(pending.exit_code, String::from("x\n"));
        assert_eq!(detector.blocks().len(), 1);
        assert_eq!(detector.blocks()[0].exit_code, Some(0));
    }

    #[test]
    fn marker_without_active_block_is_dropped() {
        let detector = BlockDetector::new();
        detector.process_output(b"<<<MARKER>>>:0 ");
        assert!(detector.take_pending().is_none());
        assert!(detector.blocks().is_empty());
    }

    #[test]
    fn malformed_marker_text_degrades_to_output() {
        let detector = BlockDetector::new();
        detector.register_user_input("cmd", 0);
        detector.process_output(b"<<<MARKER>>>:zero done\n");
        assert!(detector.take_pending().is_none());
        assert_eq!(detector.raw_capture(), "<<<MARKER>>>:zero done\n");
    }

    #[test]
    fn suspension_discards_the_active_block_and_resume_allows_new_ones() {
        let detector = BlockDetector::new();
        detector.register_user_input("vim notes", 3);
        detector.process_output(b"partial<<<MAR");
        detector.set_display_mode(DisplayMode::Raw);
        assert!(detector.active_block().is_none());
        assert!(detector.blocks().is_empty());
        assert!(detector.register_user_input("ignored", 4).is_none());

        detector.set_display_mode(DisplayMode::Blocks);
        assert!(detector.register_user_input("echo back", 5).is_some());
    }

    #[test]
    fn interrupt_closes_the_block_with_captured_output() {
        let detector = BlockDetector::new();
        detector.register_user_input("sleep 100", 0);
        detector.process_output(b"partial");
        detector.interrupt_active();
        let blocks = detector.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].status, BlockStatus::Interrupted);
        assert_eq!(blocks[0].stdout, "partial");
        assert_eq!(blocks[0].exit_code, None);
    }

    #[test]
    fn nonzero_exit_codes_mark_failure() {
        for code in [1, -1, 130] {
            let detector = BlockDetector::new();
            detector.register_user_input("cmd", 0);
            detector.process_output(format!("<<<MARKER>>>:{code} ").as_bytes());
            let pending = detector.take_pending().expect("staged");
            detector.complete_pending_block(pending.exit_code, String::new());
            assert_eq!(detector.blocks()[0].status, BlockStatus::Failure);
        }
    }
}
