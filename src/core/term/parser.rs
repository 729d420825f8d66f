//! Escape sequence classifier
//!
//! Splits decoded console output into tokens: cursor positioning, carriage
//! return, line feed, charset selection and literal characters. All other
//! control sequences are consumed and dropped.

/// Longest incomplete trailing sequence worth carrying into the next chunk
pub const MAX_CARRY: usize = 32;

/// A classified piece of console output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Absolute column (0-based) from a cursor position sequence
    CursorPosition(usize),
    /// `\r`
    CarriageReturn,
    /// `\n`
    LineFeed,
    /// ESC ( x and friends - no visible effect
    CharsetSelect,
    /// C0 control other than CR/LF/TAB, or DEL
    Control(char),
    /// Printable character
    Literal(char),
}

#[derive(Clone, Copy, Default, PartialEq)]
enum ClassifierState {
    #[default]
    Ground,
    Escape,
    Charset,
    Csi,
}

/// Character-at-a-time classifier state machine
///
/// Holds only the state of the sequence currently being scanned; nothing
/// about previously emitted tokens.
#[derive(Default)]
pub struct Classifier {
    state: ClassifierState,
    body: String,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single character
    pub fn feed(&mut self, ch: char) -> Option<Token> {
        match self.state {
            ClassifierState::Ground => self.ground(ch),
            ClassifierState::Escape => self.escape(ch),
            ClassifierState::Charset => {
                // Designator byte - discarded
                self.state = ClassifierState::Ground;
                Some(Token::CharsetSelect)
            }
            ClassifierState::Csi => self.csi(ch),
        }
    }

    /// True while a control sequence has been started but not terminated
    pub fn in_sequence(&self) -> bool {
        self.state != ClassifierState::Ground
    }

    fn ground(&mut self, ch: char) -> Option<Token> {
        match ch {
            '\x1b' => {
                self.state = ClassifierState::Escape;
                None
            }
            '\n' => Some(Token::LineFeed),
            '\r' => Some(Token::CarriageReturn),
            '\t' => Some(Token::Literal(ch)),
            c if (c as u32) < 0x20 || c == '\x7f' => Some(Token::Control(c)),
            c => Some(Token::Literal(c)),
        }
    }

    fn escape(&mut self, ch: char) -> Option<Token> {
        match ch {
            '[' => {
                self.body.clear();
                self.state = ClassifierState::Csi;
            }
            '(' | ')' | '*' | '+' => {
                self.state = ClassifierState::Charset;
            }
            _ => {
                // Two-character escape (ESC 7, ESC =, ...) - dropped
                self.state = ClassifierState::Ground;
            }
        }
        None
    }

    fn csi(&mut self, ch: char) -> Option<Token> {
        if !is_final_byte(ch) {
            self.body.push(ch);
            return None;
        }

        self.state = ClassifierState::Ground;
        match ch {
            'H' | 'f' if self.body.contains(';') => {
                let token = parse_column(&self.body).map(Token::CursorPosition);
                if token.is_none() {
                    tracing::debug!("Malformed cursor position: {:?}", self.body);
                }
                token
            }
            _ => None,
        }
    }
}

fn is_final_byte(ch: char) -> bool {
    ('@'..='~').contains(&ch)
}

/// Parse `row;col` and return the 0-based column. The row is ignored.
///
/// Empty and zero parameters take the VT default of 1.
fn parse_column(body: &str) -> Option<usize> {
    let mut params = body.split(';');
    let _row = parse_param(params.next()?)?;
    let col = parse_param(params.next()?)?;
    Some(col.max(1) - 1)
}

fn parse_param(raw: &str) -> Option<usize> {
    if raw.is_empty() {
        return Some(1);
    }
    raw.parse().ok()
}

/// Classify a whole decoded chunk.
///
/// A control sequence still open at the end of `text` is discarded.
pub fn classify(text: &str) -> Vec<Token> {
    let mut classifier = Classifier::new();
    text.chars().filter_map(|ch| classifier.feed(ch)).collect()
}

/// Split `text` into a complete head and an unterminated trailing control
/// sequence, if one is present and short enough to be worth holding back.
pub fn split_incomplete_tail(text: &str) -> (&str, &str) {
    let Some(start) = text.rfind('\x1b') else {
        return (text, "");
    };
    let tail = &text[start..];
    if tail.chars().count() > MAX_CARRY {
        return (text, "");
    }

    let mut classifier = Classifier::new();
    for ch in tail.chars() {
        classifier.feed(ch);
    }
    if classifier.in_sequence() {
        (&text[..start], tail)
    } else {
        (text, "")
    }
}
