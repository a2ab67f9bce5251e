//! Session coordination: one shell child, its screen state, and its blocks.

pub mod cwd;
pub mod hooks;
mod input;
mod viewport;

pub use cwd::{CwdResolution, CwdTracker};
pub use hooks::{ShellFlavor, prompt_hook, shell_flavor};

use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, trace};

use crate::blocks::{BlockDetector, DisplayMode, PendingFinalization};
use crate::error::SessionError;
use crate::model::{Block, BlockId, Cell};
use crate::pty::{PtyEvent, PtyPhase, PtyProcess, ShellCommand, SpawnConfig};
use crate::terminal_state::engine::PropertyChange;
use crate::terminal_state::{AlacrittyEngine, Grid, TerminalStateBridge};

use input::InputTracker;
use viewport::Viewport;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Shell program; defaults to `$SHELL`, then common locations.
    pub shell: Option<String>,
    pub args: Vec<String>,
    /// Pass a login-style argument to the shell.
    pub login_shell: bool,
    pub term: String,
    pub rows: u16,
    pub cols: u16,
    /// Scrollback capacity in rows.
    pub scrollback: usize,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Install the marker prompt hook through the environment when the
    /// shell supports it.
    pub inject_marker_hook: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            shell: None,
            args: Vec::new(),
            login_shell: true,
            term: "xterm-256color".to_string(),
            rows: 24,
            cols: 80,
            scrollback: 10_000,
            cwd: None,
            env: Vec::new(),
            inject_marker_hook: true,
        }
    }
}

impl SessionConfig {
    pub fn shell(mut self, program: impl Into<String>) -> Self {
        self.shell = Some(program.into());
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn scrollback(mut self, rows: usize) -> Self {
        self.scrollback = rows;
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn login_shell(mut self, login: bool) -> Self {
        self.login_shell = login;
        self
    }

    pub fn inject_marker_hook(mut self, inject: bool) -> Self {
        self.inject_marker_hook = inject;
        self
    }
}

/// Notifications pushed to the consumer as the session evolves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionNotice {
    /// New output was applied; snapshots are stale.
    Updated,
    BlockFinished(BlockId),
    TitleChanged(String),
    Exited(Option<i32>),
}

struct CoordinatorState {
    input: InputTracker,
    cwd: CwdTracker,
    viewport: Viewport,
    display_mode: DisplayMode,
    title: Option<String>,
    exit_code: Option<i32>,
    exited: bool,
}

/// The coordinator proper: all combined-buffer, block and viewport state.
/// The bridge, detector and coordinator locks are always taken one at a
/// time, never nested, so no ordering can invert.
pub(crate) struct SessionCore {
    bridge: Mutex<TerminalStateBridge>,
    detector: BlockDetector,
    state: Mutex<CoordinatorState>,
    notices: Sender<SessionNotice>,
}

impl SessionCore {
    pub(crate) fn new(
        bridge: TerminalStateBridge,
        initial_cwd: PathBuf,
        home: Option<PathBuf>,
        notices: Sender<SessionNotice>,
    ) -> Self {
        SessionCore {
            bridge: Mutex::new(bridge),
            detector: BlockDetector::new(),
            state: Mutex::new(CoordinatorState {
                input: InputTracker::new(),
                cwd: CwdTracker::new(initial_cwd, home),
                viewport: Viewport::new(),
                display_mode: DisplayMode::Blocks,
                title: None,
                exit_code: None,
                exited: false,
            }),
            notices,
        }
    }

    /// Applies one chunk of child output: visual state first, then marker
    /// detection, then any block that became finalizable. Returns reply
    /// bytes the engine wants written back to the child.
    pub(crate) fn handle_output(&self, bytes: &[u8]) -> Vec<u8> {
        let (events, outbound) = {
            let mut bridge = self.bridge.lock().unwrap();
            bridge.feed(bytes);
            (bridge.take_events(), bridge.take_outbound())
        };
        for event in events {
            self.apply_property(event);
        }
        self.detector.process_output(bytes);
        self.finalize_ready_block();
        let _ = self.notices.send(SessionNotice::Updated);
        outbound
    }

    fn apply_property(&self, change: PropertyChange) {
        match change {
            PropertyChange::AlternateScreen(active) => {
                let mode = if active {
                    DisplayMode::Raw
                } else {
                    DisplayMode::Blocks
                };
                debug!(target = "session", ?mode, "display mode transition");
                self.detector.set_display_mode(mode);
                let mut state = self.state.lock().unwrap();
                state.display_mode = mode;
                state.input.clear();
            }
            PropertyChange::Title(title) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.title = Some(title.clone());
                    state.cwd.observe_title(&title);
                }
                let _ = self.notices.send(SessionNotice::TitleChanged(title));
            }
            PropertyChange::CursorVisible(_) | PropertyChange::BracketedPaste(_) => {}
        }
    }

    fn finalize_ready_block(&self) {
        let Some(request) = self.detector.take_pending() else {
            return;
        };
        let stdout = self.slice_stdout(&request);
        self.detector
            .complete_pending_block(request.exit_code, stdout);
        let _ = self
            .notices
            .send(SessionNotice::BlockFinished(request.block_id));
    }

    /// Derives the block's stdout from the rendered combined buffer:
    /// `[output_start, cursor_line)`, leading command-echo lines stripped,
    /// each line right-trimmed and newline-terminated.
    ///
    /// The echo heuristic can misclassify genuine output identical to the
    /// command text; that ambiguity is inherent to text-domain extraction.
    fn slice_stdout(&self, request: &PendingFinalization) -> String {
        let mut lines: Vec<String> = {
            let bridge = self.bridge.lock().unwrap();
            let end = bridge.absolute_cursor_line();
            (request.output_start..end)
                .filter_map(|index| bridge.combined_text(index))
                .map(|line| line.trim_end().to_string())
                .collect()
        };
        while let Some(first) = lines.first() {
            if is_command_echo(first, &request.command) {
                lines.remove(0);
            } else {
                break;
            }
        }
        if lines.is_empty() {
            String::new()
        } else {
            let mut stdout = lines.join("\n");
            stdout.push('\n');
            stdout
        }
    }

    /// Runs outbound bytes through the echo tracker; submitted lines open
    /// blocks and feed the cwd heuristic. Raw mode tracks nothing.
    pub(crate) fn track_input(&self, bytes: &[u8]) -> Vec<String> {
        let submitted: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            if state.display_mode == DisplayMode::Raw {
                return Vec::new();
            }
            bytes
                .iter()
                .filter_map(|&byte| state.input.feed(byte))
                .collect()
        };
        for line in &submitted {
            let output_start = self.bridge.lock().unwrap().absolute_cursor_line();
            self.detector.register_user_input(line, output_start);
            let mut state = self.state.lock().unwrap();
            state.cwd.observe_command(line);
            trace!(target = "session", command = %line, output_start, "command submitted");
        }
        submitted
    }

    pub(crate) fn handle_exit(&self, code: Option<i32>) {
        self.detector.interrupt_active();
        {
            let mut state = self.state.lock().unwrap();
            state.exited = true;
            state.exit_code = code;
        }
        let _ = self.notices.send(SessionNotice::Exited(code));
    }

    pub(crate) fn resize_view(&self, rows: u16, cols: u16) {
        let combined = {
            let mut bridge = self.bridge.lock().unwrap();
            bridge.resize(rows, cols);
            bridge.combined_len()
        };
        let mut state = self.state.lock().unwrap();
        state.viewport.clamp(combined, rows as usize);
    }

    pub(crate) fn scroll(&self, delta_rows: f64) -> usize {
        let (combined, visible) = {
            let bridge = self.bridge.lock().unwrap();
            (bridge.combined_len(), bridge.rows() as usize)
        };
        let mut state = self.state.lock().unwrap();
        state.viewport.scroll_by(delta_rows, combined, visible)
    }

    pub(crate) fn scroll_to_bottom(&self) {
        self.state.lock().unwrap().viewport.jump_to_bottom();
    }

    pub(crate) fn viewport_offset(&self) -> usize {
        self.state.lock().unwrap().viewport.offset()
    }

    pub(crate) fn view_rows(&self) -> Vec<Vec<Cell>> {
        let offset = self.viewport_offset();
        let bridge = self.bridge.lock().unwrap();
        bridge.view_rows(offset, bridge.rows() as usize)
    }

    pub(crate) fn snapshot(&self) -> Grid {
        self.bridge.lock().unwrap().snapshot()
    }

    pub(crate) fn blocks(&self) -> Vec<Block> {
        self.detector.blocks()
    }

    pub(crate) fn display_mode(&self) -> DisplayMode {
        self.state.lock().unwrap().display_mode
    }

    pub(crate) fn working_dir(&self) -> PathBuf {
        self.state.lock().unwrap().cwd.current().to_path_buf()
    }

    pub(crate) fn title(&self) -> Option<String> {
        self.state.lock().unwrap().title.clone()
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.state.lock().unwrap().exit_code
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.state.lock().unwrap().exited
    }

    pub(crate) fn bracketed_paste(&self) -> bool {
        self.bridge.lock().unwrap().bracketed_paste()
    }

    pub(crate) fn combined_len(&self) -> usize {
        self.bridge.lock().unwrap().combined_len()
    }

    pub(crate) fn line_text(&self, index: u64) -> Option<String> {
        self.bridge.lock().unwrap().combined_text(index)
    }
}

fn is_command_echo(line: &str, command: &str) -> bool {
    let line = line.trim_end();
    line == command || line.ends_with(&format!("$ {command}"))
}

fn default_shell() -> String {
    if let Ok(shell) = env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for candidate in ["/bin/bash", "/bin/zsh", "/bin/sh"] {
        if Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }
    "/bin/sh".to_string()
}

/// A live terminal session: the child shell, its screen state, and the
/// command blocks carved out of its output.
pub struct TerminalSession {
    core: Arc<SessionCore>,
    pty: Arc<PtyProcess>,
    notices: Receiver<SessionNotice>,
    worker: Option<thread::JoinHandle<()>>,
}

impl TerminalSession {
    pub fn start(config: SessionConfig) -> Result<Self, SessionError> {
        if config.rows == 0 || config.cols == 0 {
            return Err(SessionError::InvalidSize {
                rows: config.rows,
                cols: config.cols,
            });
        }
        let shell = config.shell.clone().unwrap_or_else(default_shell);
        let initial_cwd = config
            .cwd
            .clone()
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));
        let home = env::var_os("HOME").map(PathBuf::from);

        let engine = AlacrittyEngine::new(config.rows, config.cols, config.scrollback);
        let bridge =
            TerminalStateBridge::new(Box::new(engine), config.rows, config.cols, config.scrollback);
        let (notice_tx, notice_rx) = unbounded();
        let core = Arc::new(SessionCore::new(
            bridge,
            initial_cwd.clone(),
            home,
            notice_tx,
        ));

        let mut command = ShellCommand::new(&shell)
            .env("TERM", &config.term)
            .cwd(initial_cwd);
        if config.login_shell {
            command = command.arg("-l");
        }
        command = command.args(config.args.clone());
        for (key, value) in &config.env {
            command = command.env(key, value);
        }
        if config.inject_marker_hook {
            if let Some((key, value)) = hooks::hook_env(&shell) {
                command = command.env(key, value);
            }
        }

        let (pty_tx, pty_rx) = unbounded();
        let pty = Arc::new(PtyProcess::new(pty_tx));
        Arc::clone(&pty).start(SpawnConfig::new(command, config.rows, config.cols))?;

        let worker = {
            let core = Arc::clone(&core);
            let pty_handle = Arc::clone(&pty);
            let spawned = thread::Builder::new()
                .name("driftwood-session".to_string())
                .spawn(move || worker_loop(pty_rx, core, pty_handle));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    pty.terminate();
                    return Err(SessionError::syscall("clone", &err));
                }
            }
        };

        Ok(TerminalSession {
            core,
            pty,
            notices: notice_rx,
            worker: Some(worker),
        })
    }

    /// Sends input bytes to the child, tracking them for block boundaries.
    pub fn write_input(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.core.track_input(bytes);
        self.pty.write(bytes)
    }

    /// Sends pasted text, bracket-wrapped when the child negotiated it.
    pub fn paste(&self, text: &str) -> Result<(), SessionError> {
        if self.core.bracketed_paste() {
            let mut wrapped = b"\x1b[200~".to_vec();
            wrapped.extend_from_slice(text.as_bytes());
            wrapped.extend_from_slice(b"\x1b[201~");
            self.write_input(&wrapped)
        } else {
            self.write_input(text.as_bytes())
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.pty.resize(rows, cols)?;
        self.core.resize_view(rows, cols);
        Ok(())
    }

    /// Scrolls the viewport by a possibly fractional row delta (positive is
    /// up into history) and returns the resulting offset.
    pub fn scroll(&self, delta_rows: f64) -> usize {
        self.core.scroll(delta_rows)
    }

    pub fn scroll_to_bottom(&self) {
        self.core.scroll_to_bottom();
    }

    pub fn viewport_offset(&self) -> usize {
        self.core.viewport_offset()
    }

    /// Rows a renderer should draw for the current viewport, top-down.
    pub fn view_rows(&self) -> Vec<Vec<Cell>> {
        self.core.view_rows()
    }

    /// Clone of the active screen buffer.
    pub fn snapshot(&self) -> Grid {
        self.core.snapshot()
    }

    /// Completed blocks followed by the running one, if any.
    pub fn blocks(&self) -> Vec<Block> {
        self.core.blocks()
    }

    /// Signals the foreground process group.
    pub fn interrupt(&self) -> Result<(), SessionError> {
        self.pty.send_interrupt()
    }

    /// Idempotent shutdown of the child.
    pub fn terminate(&self) {
        self.pty.terminate();
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.core.display_mode()
    }

    pub fn working_dir(&self) -> PathBuf {
        self.core.working_dir()
    }

    pub fn title(&self) -> Option<String> {
        self.core.title()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.core.exit_code()
    }

    pub fn has_exited(&self) -> bool {
        self.core.has_exited()
    }

    pub fn pty_phase(&self) -> PtyPhase {
        self.pty.phase()
    }

    /// Lines currently addressable in the combined buffer (scrollback plus
    /// visible rows).
    pub fn combined_len(&self) -> usize {
        self.core.combined_len()
    }

    /// Text of one combined-buffer line by absolute index, if it has not
    /// been evicted.
    pub fn line_text(&self, index: u64) -> Option<String> {
        self.core.line_text(index)
    }

    /// Channel of session notifications; clones share the same stream.
    pub fn notices(&self) -> Receiver<SessionNotice> {
        self.notices.clone()
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.pty.terminate();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(events: Receiver<PtyEvent>, core: Arc<SessionCore>, pty: Arc<PtyProcess>) {
    while let Ok(event) = events.recv() {
        match event {
            PtyEvent::Output(bytes) => {
                let replies = core.handle_output(&bytes);
                if !replies.is_empty() {
                    if let Err(err) = pty.write(&replies) {
                        debug!(target = "session", error = %err, "engine reply dropped");
                    }
                }
            }
            PtyEvent::Exit(code) => {
                core.handle_exit(code);
                break;
            }
        }
    }
    trace!(target = "session", "worker finished");
}
