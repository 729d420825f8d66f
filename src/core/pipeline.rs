//! Output reprocessing pipeline
//!
//! console bytes -> decode -> classify -> line buffer -> normalize -> client bytes
//!
//! [`reprocess`] is the stateless per-chunk transform. [`Reprocessor`] wraps
//! the same stages for a live session and additionally holds back input that
//! a read boundary cut in half: incomplete UTF-8, an unterminated control
//! sequence, and an announcement row that has not seen its line feed yet.

use super::normalize::{LineKind, Normalizer};
use super::term::{classify, replay, split_incomplete_tail, LineBuffer};
use crate::config::NormalizerConfig;

/// Decode UTF-8, dropping invalid bytes.
///
/// Returns the text and the trailing bytes of an incomplete sequence.
pub fn decode_lossy(mut bytes: &[u8]) -> (String, &[u8]) {
    let mut out = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                out.push_str(s);
                return (out, &[]);
            }
            Err(e) => {
                let (valid, after) = bytes.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match e.error_len() {
                    Some(n) => bytes = &after[n..],
                    None => return (out, after),
                }
            }
        }
    }
}

/// Reprocess one chunk with no state carried in or out
pub fn reprocess(bytes: &[u8], normalizer: &Normalizer, line_ending: &str) -> Vec<u8> {
    let (text, _) = decode_lossy(bytes);
    let (lines, partial) = replay(classify(&text));
    render(normalizer, lines, partial, line_ending)
}

/// Serialize normalized lines. Completed lines get `line_ending`; the
/// unterminated tail does not and keeps its whitespace.
fn render(
    normalizer: &Normalizer,
    lines: Vec<String>,
    partial: Option<String>,
    line_ending: &str,
) -> Vec<u8> {
    let mut out = String::new();
    for line in normalizer.normalize(lines) {
        out.push_str(&line);
        out.push_str(line_ending);
    }

    if let Some(partial) = partial {
        let segments = normalizer.normalize_partial(partial);
        let last = segments.len().saturating_sub(1);
        for (i, segment) in segments.iter().enumerate() {
            out.push_str(segment);
            if i < last {
                out.push_str(line_ending);
            }
        }
    }

    out.into_bytes()
}

/// Per-session pipeline state
pub struct Reprocessor {
    normalizer: Normalizer,
    line_ending: String,
    buffer: LineBuffer,
    pending_bytes: Vec<u8>,
    pending_text: String,
}

impl Reprocessor {
    pub fn new(config: &NormalizerConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            normalizer: Normalizer::new(config)?,
            line_ending: config.line_ending.clone(),
            buffer: LineBuffer::new(),
            pending_bytes: Vec::new(),
            pending_text: String::new(),
        })
    }

    /// Process one chunk read from the console
    pub fn process(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.pending_bytes);
        data.extend_from_slice(bytes);
        let (decoded, rest) = decode_lossy(&data);
        self.pending_bytes = rest.to_vec();

        let mut text = std::mem::take(&mut self.pending_text);
        text.push_str(&decoded);
        let (head, tail) = split_incomplete_tail(&text);
        for token in classify(head) {
            self.buffer.apply(token);
        }
        self.pending_text = tail.to_string();

        let lines = self.buffer.take_lines();
        let partial = if self.holding_announcement() {
            None
        } else {
            self.buffer.flush_partial()
        };
        render(&self.normalizer, lines, partial, &self.line_ending)
    }

    /// Flush anything held back; used when the console closes
    pub fn finish(&mut self) -> Vec<u8> {
        let mut text = std::mem::take(&mut self.pending_text);
        let (decoded, _) = decode_lossy(&self.pending_bytes);
        text.push_str(&decoded);
        self.pending_bytes.clear();

        for token in classify(&text) {
            self.buffer.apply(token);
        }
        let lines = self.buffer.take_lines();
        let partial = self.buffer.flush_partial();
        render(&self.normalizer, lines, partial, &self.line_ending)
    }

    fn holding_announcement(&self) -> bool {
        self.buffer.is_fresh_row()
            && self
                .buffer
                .peek_partial()
                .is_some_and(|row| self.normalizer.classify_line(&row) == LineKind::Announcement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn lf_config() -> NormalizerConfig {
        NormalizerConfig {
            line_ending: "\n".to_string(),
            ..NormalizerConfig::default()
        }
    }

    fn run(input: &[u8]) -> String {
        let normalizer = Normalizer::new(&lf_config()).expect("rules compile");
        String::from_utf8(reprocess(input, &normalizer, "\n")).expect("utf-8 output")
    }

    #[test]
    fn test_decode_drops_invalid_bytes() {
        let (text, rest) = decode_lossy(b"ab\xffcd");
        assert_eq!(text, "abcd");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decode_keeps_incomplete_tail() {
        let bytes = "x\u{e9}".as_bytes();
        let (text, rest) = decode_lossy(&bytes[..2]);
        assert_eq!(text, "x");
        assert_eq!(rest, &bytes[1..2]);
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(run(b"hello   \nworld\n"), "hello\nworld\n");
    }

    #[test]
    fn test_crlf_becomes_line_ending() {
        let normalizer = Normalizer::new(&NormalizerConfig::default()).expect("rules compile");
        let out = reprocess(b"one\r\ntwo\r\n", &normalizer, "\r\n");
        assert_eq!(out, b"one\r\ntwo\r\n");
    }

    #[test]
    fn test_cursor_positioned_spot_is_canonical() {
        let input = b"DX de W1AW:\x1b[1;17H14.250\x1b[1;27HAB1CD\x1b[1;40HFN-0042\x1b[1;70H1234Z\r\n";
        assert_eq!(
            run(input),
            "DX de W1AW:    14.250  AB1CD         FN-0042                        1234Z\n"
        );
    }

    #[test]
    fn test_prompt_without_newline_stays_open() {
        assert_eq!(run(b"\x1b[0mG0ABC de GB7XX dxspider > "), "G0ABC de GB7XX dxspider > ");
    }

    #[test]
    fn test_listing_and_blank_runs() {
        let input = b"sh/dx\r\n   14.250 AB1CD  05-Jan-2025 1230Z test\r\n\r\n\r\n\r\nend\r\n";
        assert_eq!(run(input), "sh/dx\n\nend\n");
    }

    #[test]
    fn test_two_blank_lines_become_one() {
        assert_eq!(run(b"a\r\n\r\n\r\nb\r\n"), "a\n\nb\n");
    }

    #[test]
    fn test_reprocessor_keeps_echoed_space() {
        let mut rp = Reprocessor::new(&lf_config()).expect("rules compile");
        let mut out = rp.process(b"dxspider > ");
        for byte in b"sh dx" {
            out.extend(rp.process(&[*byte]));
        }
        out.extend(rp.process(b"\r\n"));
        assert_eq!(String::from_utf8(out).unwrap(), "dxspider > sh dx\n");
    }

    #[test]
    fn test_reprocessor_carries_split_escape() {
        let mut rp = Reprocessor::new(&lf_config()).expect("rules compile");
        let mut out = rp.process(b"abc\x1b[1;");
        out.extend(rp.process(b"10HX\n"));
        assert_eq!(String::from_utf8(out).unwrap(), format!("abc{}X\n", " ".repeat(6)));
    }

    #[test]
    fn test_reprocessor_carries_split_utf8() {
        let mut rp = Reprocessor::new(&lf_config()).expect("rules compile");
        let bytes = "caf\u{e9}\n".as_bytes();
        let mut out = rp.process(&bytes[..4]);
        out.extend(rp.process(&bytes[4..]));
        assert_eq!(String::from_utf8(out).unwrap(), "caf\u{e9}\n");
    }

    #[test]
    fn test_reprocessor_holds_split_announcement() {
        let mut rp = Reprocessor::new(&lf_config()).expect("rules compile");
        let first = rp.process(b"DX de W1AW: 14.2");
        assert!(first.is_empty());
        let second = rp.process(b"50 AB1CD FN-0042 1234Z\r\n");
        assert_eq!(
            String::from_utf8(second).unwrap(),
            "DX de W1AW:    14.250  AB1CD         FN-0042                        1234Z\n"
        );
    }

    #[test]
    fn test_reprocessor_finish_flushes_held_row() {
        let mut rp = Reprocessor::new(&lf_config()).expect("rules compile");
        assert!(rp.process(b"DX de W1AW: partial").is_empty());
        assert_eq!(String::from_utf8(rp.finish()).unwrap(), "DX de W1AW: partial");
    }

    #[test]
    fn test_reprocessor_spot_redrawn_over_prompt() {
        let mut rp = Reprocessor::new(&lf_config()).expect("rules compile");
        let prompt = rp.process(b"G0ABC de GB7XX dxspider > ");
        assert_eq!(String::from_utf8(prompt).unwrap(), "G0ABC de GB7XX dxspider > ");

        let spot = rp.process(b"\rDX de W1AW: 14.250 AB1CD FN-0042 1234Z\r\n");
        assert_eq!(
            String::from_utf8(spot).unwrap(),
            "\nDX de W1AW:    14.250  AB1CD         FN-0042                        1234Z\n"
        );
    }

    #[test]
    fn test_reprocessor_echo_after_prompt() {
        let mut rp = Reprocessor::new(&lf_config()).expect("rules compile");
        rp.process(b"dxspider > ");
        assert_eq!(rp.process(b"sh/dx"), b"sh/dx");
        assert_eq!(rp.process(b"\r\n"), b"\n");
    }

    #[test]
    fn test_stateless_chunks_flush_partial_rows() {
        let normalizer = Normalizer::new(&lf_config()).expect("rules compile");
        let out = reprocess(b"DX de W1AW: 14.2", &normalizer, "\n");
        assert_eq!(out, b"DX de W1AW: 14.2");
    }

    proptest! {
        #[test]
        fn prop_reprocess_is_total(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let normalizer = Normalizer::new(&NormalizerConfig::default()).expect("rules compile");
            let out = reprocess(&bytes, &normalizer, "\r\n");
            prop_assert!(String::from_utf8(out).is_ok());
        }

        #[test]
        fn prop_reprocessor_is_total(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..128), 0..8)
        ) {
            let mut rp = Reprocessor::new(&NormalizerConfig::default()).expect("rules compile");
            for chunk in &chunks {
                let _ = rp.process(chunk);
            }
            let _ = rp.finish();
        }

        #[test]
        fn prop_cursor_position_places_char(col in 1usize..=200, ch in "[A-Za-z0-9]") {
            let input = format!("\x1b[1;{col}H{ch}\n");
            let expected = format!("{}{}\n", " ".repeat(col - 1), ch);
            prop_assert_eq!(run(input.as_bytes()), expected);
        }
    }
}
