use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use unicode_width::UnicodeWidthStr;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Color {
    Default,
    /// 256-color palette index.
    Indexed(u8),
    /// 24-bit true color.
    Rgb(u8, u8, u8),
}

impl Color {
    pub fn is_default(&self) -> bool {
        matches!(self, Color::Default)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CellAttributes {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub reverse: bool,
    pub blink: bool,
    pub dim: bool,
    pub hidden: bool,
}

/// Resolved style of one cell: colors plus attribute bits. The default-color
/// state is carried by `Color::Default` rather than separate flags.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CellStyle {
    pub fg_color: Color,
    pub bg_color: Color,
    pub attributes: CellAttributes,
}

impl Default for CellStyle {
    fn default() -> Self {
        CellStyle {
            fg_color: Color::Default,
            bg_color: Color::Default,
            attributes: CellAttributes::default(),
        }
    }
}

impl CellStyle {
    /// Stable hash of the style, cheap to compare when diffing rows.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// One display cell: a grapheme cluster (empty for the trailing half of a
/// wide character), its column width, and its style.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cell {
    pub glyph: String,
    /// Columns occupied: 0 (continuation spacer), 1 or 2.
    pub width: u8,
    pub style: CellStyle,
    pub style_hash: u64,
}

impl Default for Cell {
    fn default() -> Self {
        Cell::new(" ", CellStyle::default())
    }
}

impl Cell {
    pub fn new(glyph: impl Into<String>, style: CellStyle) -> Self {
        let glyph = glyph.into();
        let width = UnicodeWidthStr::width(glyph.as_str()).min(2) as u8;
        Cell {
            style_hash: style.fingerprint(),
            glyph,
            width,
            style,
        }
    }

    /// Builds a cell with an explicit width, for callers that already know
    /// it (wide-character flags from the VT engine).
    pub fn with_width(glyph: impl Into<String>, width: u8, style: CellStyle) -> Self {
        Cell {
            style_hash: style.fingerprint(),
            glyph: glyph.into(),
            width: width.min(2),
            style,
        }
    }

    /// Zero-width continuation cell behind a wide character.
    pub fn spacer(style: CellStyle) -> Self {
        Cell::with_width(String::new(), 0, style)
    }

    pub fn is_blank(&self) -> bool {
        self.glyph.is_empty() || self.glyph == " "
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_follows_glyph() {
        assert_eq!(Cell::new("a", CellStyle::default()).width, 1);
        assert_eq!(Cell::new("あ", CellStyle::default()).width, 2);
        assert_eq!(Cell::spacer(CellStyle::default()).width, 0);
    }

    #[test]
    fn fingerprint_tracks_style_identity() {
        let plain = CellStyle::default();
        let mut bold = CellStyle::default();
        bold.attributes.bold = true;
        assert_eq!(plain.fingerprint(), CellStyle::default().fingerprint());
        assert_ne!(plain.fingerprint(), bold.fingerprint());
    }

    #[test]
    fn equal_styles_give_equal_cell_hashes() {
        let style = CellStyle {
            fg_color: Color::Indexed(2),
            bg_color: Color::Rgb(10, 20, 30),
            attributes: CellAttributes::default(),
        };
        assert_eq!(
            Cell::new("x", style).style_hash,
            Cell::new("y", style).style_hash
        );
    }
}
