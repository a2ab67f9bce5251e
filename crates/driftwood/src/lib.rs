//! driftwood: a terminal-session engine.
//!
//! Owns a shell child on a pseudo-terminal, keeps a live screen grid plus
//! bounded scrollback, and segments the output stream into command blocks
//! by detecting an out-of-band completion marker emitted by a cooperating
//! shell prompt. Rendering, application chrome and the VT interpreter
//! itself live outside this crate; see [`terminal_state::engine`] for the
//! engine boundary and [`session::TerminalSession`] for the consumer
//! surface.

pub mod blocks;
pub mod error;
pub mod model;
pub mod pty;
pub mod session;
pub mod terminal_state;

pub use blocks::{BlockDetector, DisplayMode, MARKER_PREFIX, PendingFinalization};
pub use error::SessionError;
pub use model::{Block, BlockId, BlockStatus, Cell, CellAttributes, CellStyle, Color};
pub use pty::{PtyEvent, PtyPhase, PtyProcess, ShellCommand, SpawnConfig};
pub use session::{SessionConfig, SessionNotice, TerminalSession};
pub use terminal_state::{CursorPosition, Grid, Scrollback, TerminalStateBridge};
