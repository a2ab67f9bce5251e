pub mod block;
pub mod cell;

pub use block::{Block, BlockId, BlockStatus};
pub use cell::{Cell, CellAttributes, CellStyle, Color};
