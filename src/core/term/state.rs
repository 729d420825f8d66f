//! Virtual line buffer
//!
//! A single fixed-width row with a column cursor. Tokens from the classifier
//! mutate the row in place; a line feed materializes it as a logical line.

use super::parser::Token;

/// Number of addressable columns in the virtual row
pub const ROW_WIDTH: usize = 200;

/// A single display cell
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cell {
    #[default]
    Blank,
    Char(char),
}

impl Cell {
    /// Get the character (or space if blank)
    pub fn c(&self) -> char {
        match self {
            Cell::Blank => ' ',
            Cell::Char(ch) => *ch,
        }
    }

    fn is_blank(&self) -> bool {
        self.c().is_whitespace()
    }
}

/// Fixed-capacity row of cells
pub struct VirtualRow {
    cells: [Cell; ROW_WIDTH],
}

impl Default for VirtualRow {
    fn default() -> Self {
        Self {
            cells: [Cell::Blank; ROW_WIDTH],
        }
    }
}

impl VirtualRow {
    pub fn clear(&mut self) {
        self.cells = [Cell::Blank; ROW_WIDTH];
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(Cell::is_blank)
    }

    /// Row contents with trailing blanks trimmed
    pub fn materialize(&self) -> String {
        let text: String = self.cells.iter().map(Cell::c).collect();
        text.trim_end().to_string()
    }

    /// Row contents up to at least `min_len` columns
    pub fn materialize_to(&self, min_len: usize) -> String {
        let mut text = self.materialize();
        let width = text.chars().count();
        let end = min_len.min(ROW_WIDTH);
        if width < end {
            text.extend(self.cells[width..end].iter().map(Cell::c));
        }
        text
    }
}

/// Row + cursor state machine. Performs no I/O.
#[derive(Default)]
pub struct LineBuffer {
    row: VirtualRow,
    cursor: usize,
    lines: Vec<String>,
    /// Columns of the current row already handed out by `flush_partial`
    emitted: usize,
    /// Carriage return seen after part of the row was handed out
    redraw: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor column
    #[allow(dead_code)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// True until part of the current row has been flushed
    pub fn is_fresh_row(&self) -> bool {
        self.emitted == 0
    }

    /// Apply a single token
    pub fn apply(&mut self, token: Token) {
        match token {
            Token::Literal(ch) => self.put_char(ch),
            Token::CarriageReturn => self.carriage_return(),
            Token::LineFeed => self.linefeed(),
            Token::CursorPosition(col) => self.set_column(col),
            Token::CharsetSelect | Token::Control(_) => {}
        }
    }

    /// Write at the cursor; characters past the last column are dropped
    pub fn put_char(&mut self, ch: char) {
        self.begin_redraw();
        if self.cursor < ROW_WIDTH {
            self.row.cells[self.cursor] = Cell::Char(ch);
            self.cursor += 1;
        }
    }

    /// Carriage return - column 0, row untouched
    pub fn carriage_return(&mut self) {
        self.cursor = 0;
        if self.emitted > 0 {
            self.redraw = true;
        }
    }

    /// Line feed - commit the row and start a blank one
    pub fn linefeed(&mut self) {
        self.commit();
    }

    /// Absolute column move; out-of-range targets are ignored
    pub fn set_column(&mut self, col: usize) {
        self.begin_redraw();
        if col < ROW_WIDTH {
            self.cursor = col;
        }
    }

    /// Take the lines committed so far
    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    /// The part of the uncommitted row not yet handed out.
    ///
    /// A fresh row must hold something visible; blanks the cursor has
    /// already moved past are kept (prompt spacing).
    pub fn peek_partial(&self) -> Option<String> {
        if self.emitted == 0 && self.row.is_blank() {
            return None;
        }
        let text = self.row.materialize_to(self.cursor);
        let unsent: String = text.chars().skip(self.emitted).collect();
        (!unsent.is_empty()).then_some(unsent)
    }

    /// End of input: hand out the uncommitted row.
    ///
    /// The row stays in place so later writes continue it; only columns
    /// past those handed out here are emitted again.
    pub fn flush_partial(&mut self) -> Option<String> {
        let unsent = self.peek_partial()?;
        self.emitted += unsent.chars().count();
        Some(unsent)
    }

    fn commit(&mut self) {
        let text = self.row.materialize();
        self.lines.push(text.chars().skip(self.emitted).collect());
        self.row.clear();
        self.cursor = 0;
        self.emitted = 0;
        self.redraw = false;
    }

    /// Redrawing over a row that was partly sent starts a new line
    fn begin_redraw(&mut self) {
        if self.redraw {
            self.commit();
        }
    }
}

/// Run a token sequence through a fresh buffer.
///
/// Returns the committed lines and the unterminated trailing line, if any.
pub fn replay<I>(tokens: I) -> (Vec<String>, Option<String>)
where
    I: IntoIterator<Item = Token>,
{
    let mut buffer = LineBuffer::new();
    for token in tokens {
        buffer.apply(token);
    }
    let partial = buffer.flush_partial();
    (buffer.take_lines(), partial)
}
