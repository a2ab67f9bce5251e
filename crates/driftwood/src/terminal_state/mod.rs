pub mod alacritty;
pub mod bridge;
pub mod engine;
pub mod grid;
pub mod scrollback;

pub use alacritty::AlacrittyEngine;
pub use bridge::TerminalStateBridge;
pub use engine::{CellSource, DamageRegion, EngineListener, PropertyChange, VtEngine};
pub use grid::{CursorPosition, Grid};
pub use scrollback::Scrollback;
