//! Metrics and encoding for the font we draw invisible text with.
//!
//! We never embed a font. Recognized words are drawn with one of the PDF
//! "standard 14" fonts, which every viewer has built in, so all we need is the
//! advance width of each glyph (from Adobe's AFM files) and a way to turn
//! Unicode text into single-byte `WinAnsiEncoding` codes.

/// A standard Type 1 font with single-byte `WinAnsiEncoding`.
#[derive(Debug)]
pub struct StandardFont {
    /// The PDF `BaseFont` name.
    pub base_font: &'static str,

    /// Advance widths in 1/1000 em, indexed by `code - FIRST_CODE`. Zero means
    /// the code has no glyph.
    widths: &'static [u16; CODE_COUNT],
}

/// First WinAnsi code with a glyph (space).
const FIRST_CODE: usize = 0x20;

/// Number of codes in our width tables (0x20..=0xFF).
const CODE_COUNT: usize = 0x100 - FIRST_CODE;

/// Times-Roman, the font our overlays use by default.
pub static TIMES_ROMAN: StandardFont = StandardFont {
    base_font: "Times-Roman",
    widths: &TIMES_ROMAN_WIDTHS,
};

/// Times-Roman advance widths for WinAnsi codes 0x20..=0xFF.
#[rustfmt::skip]
static TIMES_ROMAN_WIDTHS: [u16; CODE_COUNT] = [
    // 0x20
    250, 333, 408, 500, 500, 833, 778, 180, 333, 333, 500, 564, 250, 333, 250, 278,
    // 0x30
    500, 500, 500, 500, 500, 500, 500, 500, 500, 500, 278, 278, 564, 564, 564, 444,
    // 0x40
    921, 722, 667, 667, 722, 611, 556, 722, 722, 333, 389, 722, 611, 889, 722, 722,
    // 0x50
    556, 722, 667, 556, 611, 722, 722, 944, 722, 722, 611, 333, 278, 333, 469, 500,
    // 0x60
    333, 444, 500, 444, 500, 444, 333, 500, 500, 278, 278, 500, 278, 778, 500, 500,
    // 0x70
    500, 500, 333, 389, 278, 500, 500, 722, 500, 500, 444, 480, 200, 480, 541, 0,
    // 0x80
    500, 0, 333, 500, 444, 1000, 500, 500, 333, 1000, 556, 333, 889, 0, 611, 0,
    // 0x90
    0, 333, 333, 444, 444, 350, 500, 1000, 333, 980, 389, 333, 722, 0, 444, 722,
    // 0xA0
    250, 333, 500, 500, 500, 500, 200, 500, 333, 760, 276, 500, 564, 333, 760, 333,
    // 0xB0
    400, 564, 300, 300, 333, 500, 453, 250, 333, 300, 310, 500, 750, 750, 750, 444,
    // 0xC0
    722, 722, 722, 722, 722, 722, 889, 667, 611, 611, 611, 611, 333, 333, 333, 333,
    // 0xD0
    722, 722, 722, 722, 722, 722, 722, 564, 722, 722, 722, 722, 722, 722, 556, 500,
    // 0xE0
    444, 444, 444, 444, 444, 444, 667, 444, 444, 444, 444, 444, 278, 278, 278, 278,
    // 0xF0
    500, 500, 500, 500, 500, 500, 500, 564, 500, 500, 500, 500, 500, 500, 500, 500,
];

/// Characters whose WinAnsi code differs from their Latin-1 code point.
const WIN_ANSI_SPECIALS: &[(char, u8)] = &[
    ('\u{20AC}', 0x80),
    ('\u{201A}', 0x82),
    ('\u{0192}', 0x83),
    ('\u{201E}', 0x84),
    ('\u{2026}', 0x85),
    ('\u{2020}', 0x86),
    ('\u{2021}', 0x87),
    ('\u{02C6}', 0x88),
    ('\u{2030}', 0x89),
    ('\u{0160}', 0x8A),
    ('\u{2039}', 0x8B),
    ('\u{0152}', 0x8C),
    ('\u{017D}', 0x8E),
    ('\u{2018}', 0x91),
    ('\u{2019}', 0x92),
    ('\u{201C}', 0x93),
    ('\u{201D}', 0x94),
    ('\u{2022}', 0x95),
    ('\u{2013}', 0x96),
    ('\u{2014}', 0x97),
    ('\u{02DC}', 0x98),
    ('\u{2122}', 0x99),
    ('\u{0161}', 0x9A),
    ('\u{203A}', 0x9B),
    ('\u{0153}', 0x9C),
    ('\u{017E}', 0x9E),
    ('\u{0178}', 0x9F),
];

/// Text encoded for a [`StandardFont`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedText {
    /// WinAnsi codes, ready for a `Tj` operator.
    pub bytes: Vec<u8>,

    /// Characters that have no glyph in the font and were left out.
    pub dropped: Vec<char>,
}

impl StandardFont {
    /// Map one character to its WinAnsi code, if the font can draw it.
    pub fn code_for(&self, c: char) -> Option<u8> {
        let code = match u32::from(c) {
            cp @ (0x20..=0x7E | 0xA0..=0xFF) => cp as u8,
            _ => WIN_ANSI_SPECIALS
                .iter()
                .find(|(special, _)| *special == c)
                .map(|(_, code)| *code)?,
        };
        (self.glyph_width(code) > 0).then_some(code)
    }

    /// Advance width of a code in 1/1000 em.
    fn glyph_width(&self, code: u8) -> u16 {
        usize::from(code)
            .checked_sub(FIRST_CODE)
            .map_or(0, |idx| self.widths[idx])
    }

    /// Encode text, leaving out characters without a glyph.
    pub fn encode(&self, text: &str) -> EncodedText {
        let mut encoded = EncodedText::default();
        for c in text.chars() {
            match self.code_for(c) {
                Some(code) => encoded.bytes.push(code),
                None => encoded.dropped.push(c),
            }
        }
        encoded
    }

    /// Width in points of `text` drawn at `font_size`, with 100% horizontal
    /// scaling. Characters the font cannot draw contribute nothing.
    pub fn text_width(&self, text: &str, font_size: f64) -> f64 {
        let units: u32 = text
            .chars()
            .filter_map(|c| self.code_for(c))
            .map(|code| u32::from(self.glyph_width(code)))
            .sum();
        f64::from(units) / 1000.0 * font_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_ascii_words() {
        // H + e + l + l + o = 722 + 444 + 278 + 278 + 500.
        let width = TIMES_ROMAN.text_width("Hello", 10.0);
        assert!((width - 22.22).abs() < 1e-9);
        assert!((TIMES_ROMAN.text_width(" ", 1000.0) - 250.0).abs() < 1e-9);
    }

    #[test]
    fn encodes_latin1_and_win_ansi_punctuation() {
        let encoded = TIMES_ROMAN.encode("café “quoted” – €5");
        assert!(encoded.dropped.is_empty());
        assert_eq!(
            encoded.bytes,
            b"caf\xE9 \x93quoted\x94 \x96 \x805".to_vec()
        );
    }

    #[test]
    fn drops_characters_without_glyphs() {
        let encoded = TIMES_ROMAN.encode("日本\tA");
        assert_eq!(encoded.bytes, b"A".to_vec());
        assert_eq!(encoded.dropped, vec!['日', '本', '\t']);
        assert_eq!(TIMES_ROMAN.text_width("日本", 12.0), 0.0);
    }
}
