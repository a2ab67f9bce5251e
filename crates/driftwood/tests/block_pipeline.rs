//! Public-surface pipeline tests: the VT bridge and the block detector fed
//! the same byte stream, the way the session wires them.

use driftwood::terminal_state::AlacrittyEngine;
use driftwood::{BlockDetector, BlockStatus, DisplayMode, MARKER_PREFIX, TerminalStateBridge};

struct Pipeline {
    bridge: TerminalStateBridge,
    detector: BlockDetector,
}

impl Pipeline {
    fn new(rows: u16, cols: u16) -> Self {
        let engine = AlacrittyEngine::new(rows, cols, 200);
        Pipeline {
            bridge: TerminalStateBridge::new(Box::new(engine), rows, cols, 200),
            detector: BlockDetector::new(),
        }
    }

    fn submit(&mut self, command: &str) {
        let start = self.bridge.absolute_cursor_line();
        self.detector.register_user_input(command, start);
    }

    fn output(&mut self, bytes: &[u8]) {
        self.bridge.feed(bytes);
        self.detector.process_output(bytes);
        if let Some(request) = self.detector.take_pending() {
            let end = self.bridge.absolute_cursor_line();
            let mut lines: Vec<String> = (request.output_start..end)
                .filter_map(|index| self.bridge.combined_text(index))
                .map(|line| line.trim_end().to_string())
                .collect();
            while lines.first().map(|line| line.as_str()) == Some(request.command.as_str()) {
                lines.remove(0);
            }
            let stdout = if lines.is_empty() {
                String::new()
            } else {
                let mut text = lines.join("\n");
                text.push('\n');
                text
            };
            self.detector.complete_pending_block(request.exit_code, stdout);
        }
    }
}

#[test]
fn a_command_round_trip_produces_one_block() {
    let mut pipeline = Pipeline::new(8, 60);
    pipeline.submit("echo hi");
    pipeline.output(format!("hi\n{MARKER_PREFIX}0 ").as_bytes());

    let blocks = pipeline.detector.blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].command, "echo hi");
    assert_eq!(blocks[0].stdout, "hi\n");
    assert_eq!(blocks[0].status, BlockStatus::Success);
}

#[test]
fn markers_split_across_chunks_behave_like_whole_ones() {
    let mut pipeline = Pipeline::new(8, 60);
    pipeline.submit("false");
    pipeline.output(b"fail\n<<<MAR");
    pipeline.output(b"KER>>>:1 ");

    let blocks = pipeline.detector.blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].stdout, "fail\n");
    assert_eq!(blocks[0].exit_code, Some(1));
    assert_eq!(blocks[0].status, BlockStatus::Failure);
}

#[test]
fn long_running_output_lands_in_scrollback_but_blocks_still_slice() {
    let mut pipeline = Pipeline::new(4, 40);
    pipeline.submit("seq 1 12");
    let body: String = (1..=12).map(|i| format!("{i}\n")).collect();
    pipeline.output(format!("{body}{MARKER_PREFIX}0 ").as_bytes());

    assert!(pipeline.bridge.scrollback_len() > 0);
    let blocks = pipeline.detector.blocks();
    assert_eq!(blocks.len(), 1);
    let stdout = &blocks[0].stdout;
    assert!(stdout.starts_with("1\n"));
    assert!(stdout.contains("\n12\n"));
}

#[test]
fn alternate_screen_routes_to_raw_passthrough_and_back() {
    let mut pipeline = Pipeline::new(6, 40);
    pipeline.submit("vim");
    pipeline.bridge.feed(b"\x1b[?1049h");
    assert!(pipeline.bridge.alt_active());
    for change in pipeline.bridge.take_events() {
        if let driftwood::terminal_state::engine::PropertyChange::AlternateScreen(active) = change {
            let mode = if active {
                DisplayMode::Raw
            } else {
                DisplayMode::Blocks
            };
            pipeline.detector.set_display_mode(mode);
        }
    }
    assert_eq!(pipeline.detector.display_mode(), DisplayMode::Raw);
    assert!(pipeline.detector.blocks().is_empty());

    pipeline.bridge.feed(b"\x1b[?1049l");
    for change in pipeline.bridge.take_events() {
        if let driftwood::terminal_state::engine::PropertyChange::AlternateScreen(active) = change {
            let mode = if active {
                DisplayMode::Raw
            } else {
                DisplayMode::Blocks
            };
            pipeline.detector.set_display_mode(mode);
        }
    }
    assert_eq!(pipeline.detector.display_mode(), DisplayMode::Blocks);
    assert!(pipeline.detector.register_user_input("echo back", 0).is_some());
}
