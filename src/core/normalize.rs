//! Spot line normalizer
//!
//! Rewrites the logical lines recovered by the line buffer into the fixed
//! column layout logging software expects. Each stage is a plain function of
//! its input lines and never fails: anything a stage does not recognize is
//! passed through untouched.
//!
//! Stages, in order:
//!
//! 1. [`Normalizer::strip_artifacts`] - status-line noise
//! 2. [`Normalizer::suppress_listings`] - bulk query rows
//! 3. [`Normalizer::rewrite_announcements`] - canonical spot layout
//! 4. [`Normalizer::repair_boundaries`] - undo glued lines
//! 5. [`collapse_blank_runs`] - at most one blank line

use regex::Regex;
use tracing::debug;

use crate::config::NormalizerConfig;

/// Field widths of the canonical announcement layout
const FREQ_WIDTH: usize = 8;
const CALL_WIDTH: usize = 13;
const COMMENT_WIDTH: usize = 30;

/// What a logical line looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Blank,
    /// Real-time spot, starts with the announcement prefix
    Announcement,
    /// Row of a bulk query result
    Listing,
    Other,
}

/// Compiled rule set for one session
pub struct Normalizer {
    prefix: String,
    prompt: String,
    banner_fragments: Vec<String>,
    artifact_literals: Vec<String>,
    suppress_listings: bool,
    announcement: Regex,
    listing: Regex,
    listing_row: Regex,
    park_code: Regex,
    trailing_digits: Regex,
    size_tag: Regex,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self, regex::Error> {
        let prefix = regex::escape(&config.announcement_prefix);
        Ok(Self {
            prefix: config.announcement_prefix.clone(),
            prompt: config.prompt_literal.clone(),
            banner_fragments: non_empty(&config.banner_fragments),
            artifact_literals: non_empty(&config.artifact_literals),
            suppress_listings: config.suppress_listings,
            announcement: Regex::new(&format!(
                r"^({prefix}[^\s:]+:)\s*(\d+\.\d+)\s+(.+?)\s*(\d{{4}}Z)$"
            ))?,
            listing: Regex::new(r"^\s+\d+\.\d+\s+([A-Z0-9/]+)")?,
            listing_row: Regex::new(
                r"^(\s*)(\d+\.\d+)\s+([A-Z0-9/;:.,]+?)\s*(\d{1,2}-[A-Za-z]{3}-\d{4}\s+\d{4}Z.*)$",
            )?,
            park_code: Regex::new(r"[A-Z]{1,2}-\d{4,5}")?,
            trailing_digits: Regex::new(r"(?:^|\s+)-\d{4,}\s*$")?,
            size_tag: Regex::new(r"\[\d{1,4}x\d{1,4}(?:#[0-9A-Fa-f]+)?\]")?,
        })
    }

    /// Run all stages over one pass worth of lines
    pub fn normalize(&self, lines: Vec<String>) -> Vec<String> {
        let lines = self.strip_artifacts(lines);
        let lines = self.suppress_listings(lines);
        let lines = self.rewrite_announcements(lines);
        let lines = self.repair_boundaries(lines);
        collapse_blank_runs(lines)
    }

    /// Stages 1-4 for an unterminated row. Its columns count as sent once
    /// flushed, so blank-run collapse is skipped and whitespace is kept.
    pub fn normalize_partial(&self, line: String) -> Vec<String> {
        if line.trim().is_empty() {
            return vec![line];
        }
        let lines = self.strip_artifacts(vec![line]);
        let lines = self.suppress_listings(lines);
        let lines = self.rewrite_announcements(lines);
        self.repair_boundaries(lines)
    }

    pub fn classify_line(&self, line: &str) -> LineKind {
        if line.trim().is_empty() {
            LineKind::Blank
        } else if !self.prefix.is_empty() && line.starts_with(&self.prefix) {
            LineKind::Announcement
        } else if self
            .listing
            .captures(line)
            .is_some_and(|caps| is_callsign_shaped(&caps[1]))
        {
            LineKind::Listing
        } else {
            LineKind::Other
        }
    }

    /// Stage 1: remove trailing `-NNNN` counters, terminal size tags and
    /// known leaked escape residue at line ends
    pub fn strip_artifacts(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .map(|line| {
                let mut out = self.size_tag.replace_all(&line, "").into_owned();
                out = self.strip_trailing_literals(out);
                out = self.trailing_digits.replace(&out, "").into_owned();
                if out != line {
                    out.truncate(out.trim_end().len());
                }
                out
            })
            .collect()
    }

    /// Residue is only recognized at the end of a line; the same text
    /// inside a line is content (`[K-1234]` is a park reference)
    fn strip_trailing_literals(&self, mut line: String) -> String {
        loop {
            let trimmed = line.trim_end();
            let stripped = self
                .artifact_literals
                .iter()
                .find_map(|literal| trimmed.strip_suffix(literal.as_str()));
            match stripped {
                Some(rest) => line = rest.to_string(),
                None => return line,
            }
        }
    }

    /// Stage 2: drop bulk listing rows (or reformat them when suppression is off)
    pub fn suppress_listings(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter_map(|line| match self.classify_line(&line) {
                LineKind::Listing if self.suppress_listings => {
                    debug!("Dropped listing row: {:?}", line);
                    None
                }
                LineKind::Listing => Some(self.reformat_listing(&line).unwrap_or(line)),
                _ => Some(line),
            })
            .collect()
    }

    /// Stage 3: canonical layout for announcement lines
    pub fn rewrite_announcements(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .map(|line| self.rewrite_line(line))
            .collect()
    }

    fn rewrite_line(&self, line: String) -> String {
        if self.classify_line(&line) != LineKind::Announcement {
            return line;
        }
        match self.format_announcement(&line) {
            Some(formatted) => {
                if formatted != line {
                    debug!("Reformatted spot: {:?} -> {:?}", line, formatted);
                }
                formatted
            }
            None => line,
        }
    }

    /// Canonical form of an announcement, or `None` if it does not parse
    pub fn format_announcement(&self, line: &str) -> Option<String> {
        let caps = self.announcement.captures(line)?;
        let prefix = &caps[1];
        let freq = &caps[2];
        let (call, comment) = self.split_callsign(caps[3].trim())?;
        let timestamp = &caps[4];

        Some(format!(
            "{prefix}  {freq:>fw$}  {call:<cw$} {comment:<mw$} {timestamp}",
            fw = FREQ_WIDTH,
            cw = CALL_WIDTH,
            mw = COMMENT_WIDTH,
        ))
    }

    /// Split spot text into callsign and comment.
    ///
    /// A park reference glued to (or directly after) a single callsign token
    /// marks the split; otherwise the first whitespace run does.
    fn split_callsign<'a>(&self, text: &'a str) -> Option<(&'a str, &'a str)> {
        if let Some(at) = self.park_split(text) {
            return non_empty_call(clean_callsign(text[..at].trim_end()), &text[at..]);
        }

        match text.split_once(char::is_whitespace) {
            Some((call, rest)) => non_empty_call(clean_callsign(call), rest.trim()),
            None => non_empty_call(clean_callsign(text), ""),
        }
    }

    /// Byte offset where a park reference glued to a single callsign token
    /// begins.
    ///
    /// A one-letter park prefix can also be read as the callsign's last
    /// letter (`W1AWK-1234`), a two-letter one as its last two
    /// (`N0CALLUS-1234`). The longer callsign wins when its suffix after the
    /// last digit is at most 3 letters, then at most 4; otherwise the
    /// two-letter park prefix is taken.
    fn park_split(&self, text: &str) -> Option<usize> {
        let code = self.park_code.find(text)?;
        let letters = code.as_str().find('-')?;

        let mut starts = vec![code.start() + letters - 1];
        if letters == 2 {
            starts.push(code.start());
        }
        let heads: Vec<(usize, usize)> = starts
            .into_iter()
            .filter_map(|start| {
                let head = text[..start].trim_end();
                (!head.is_empty() && !head.contains(char::is_whitespace))
                    .then(|| (start, suffix_letters(clean_callsign(head))))
            })
            .collect();

        [3, 4]
            .iter()
            .find_map(|&limit| heads.iter().find(|(_, n)| *n <= limit))
            .or(heads.last())
            .map(|&(start, _)| start)
    }

    fn reformat_listing(&self, line: &str) -> Option<String> {
        let caps = self.listing_row.captures(line)?;
        let formatted = format!(
            "{}{:>fw$}  {:<cw$} {}",
            &caps[1],
            &caps[2],
            clean_callsign(&caps[3]),
            &caps[4],
            fw = FREQ_WIDTH,
            cw = CALL_WIDTH,
        );
        debug!("Reformatted listing row: {:?} -> {:?}", line, formatted);
        Some(formatted)
    }

    /// Stage 4: break lines the column reconstruction glued together
    pub fn repair_boundaries(&self, lines: Vec<String>) -> Vec<String> {
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            let mut rest = line.as_str();
            let mut split = false;
            while let Some(at) = self.next_boundary(rest) {
                let head = rest[..at].trim_end();
                if !head.is_empty() {
                    out.push(self.finish_segment(head, split));
                }
                rest = rest[at..].trim_start();
                split = true;
            }
            out.push(self.finish_segment(rest, split));
        }
        out
    }

    fn finish_segment(&self, segment: &str, split: bool) -> String {
        if split {
            // Segments cut loose from a glued line have not been through stage 3
            self.rewrite_line(segment.to_string())
        } else {
            segment.to_string()
        }
    }

    /// Earliest byte offset in `line` where a new line should begin
    fn next_boundary(&self, line: &str) -> Option<usize> {
        let mut candidates = Vec::new();

        if !self.prefix.is_empty() {
            let skip = line.chars().next().map_or(0, char::len_utf8);
            if let Some(pos) = line[skip..].find(&self.prefix) {
                candidates.push(pos + skip);
            }
        }

        let literals = std::iter::once(&self.prompt).chain(&self.banner_fragments);
        for literal in literals.filter(|l| !l.is_empty()) {
            if let Some(end) = glued_end(line, literal) {
                candidates.push(end);
            }
        }

        candidates.into_iter().min()
    }
}

/// Stage 5: a run of three or more line breaks becomes two.
///
/// Between text lines that leaves one blank line; before the first text line
/// of a pass, two.
pub fn collapse_blank_runs(lines: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut run = 0;
    let mut seen_text = false;

    for line in lines {
        if line.trim().is_empty() {
            run += 1;
            let limit = if seen_text { 1 } else { 2 };
            if run <= limit {
                out.push(String::new());
            }
        } else {
            run = 0;
            seen_text = true;
            out.push(line);
        }
    }
    out
}

/// End offset of `literal` in `line` when text follows it with no whitespace
fn glued_end(line: &str, literal: &str) -> Option<usize> {
    let end = line.find(literal)? + literal.len();
    line[end..]
        .starts_with(|c: char| !c.is_whitespace())
        .then_some(end)
}

/// Remove trailing punctuation the cluster leaves on callsigns
pub fn clean_callsign(call: &str) -> &str {
    call.trim_end_matches([';', ':', '.', ','])
}

/// Letters after the last digit of a callsign
fn suffix_letters(call: &str) -> usize {
    call.chars()
        .rev()
        .take_while(|c| c.is_ascii_alphabetic())
        .count()
}

fn is_callsign_shaped(token: &str) -> bool {
    (3..=15).contains(&token.len())
        && token.chars().any(|c| c.is_ascii_digit())
        && token.chars().any(|c| c.is_ascii_uppercase())
        && token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '/')
}

fn non_empty_call<'a>(call: &'a str, comment: &'a str) -> Option<(&'a str, &'a str)> {
    if call.is_empty() {
        None
    } else {
        Some((call, comment))
    }
}

fn non_empty(items: &[String]) -> Vec<String> {
    items.iter().filter(|s| !s.is_empty()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(&NormalizerConfig::default()).expect("default rules compile")
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    const CANONICAL: &str =
        "DX de W1AW:    14.250  AB1CD         FN-0042                        1234Z";

    #[test]
    fn test_canonical_announcement() {
        let n = normalizer();
        let out = n.normalize(lines(&["DX de W1AW: 14.250 AB1CD FN-0042 1234Z"]));
        assert_eq!(out, lines(&[CANONICAL]));
    }

    #[test]
    fn test_canonical_field_positions() {
        let prefix = "DX de W1AW:";
        let freq_end = prefix.len() + 2 + FREQ_WIDTH;
        let call_start = freq_end + 2;
        let comment_start = call_start + CALL_WIDTH + 1;
        let ts_start = comment_start + COMMENT_WIDTH + 1;

        assert_eq!(&CANONICAL[..freq_end], "DX de W1AW:    14.250");
        assert_eq!(&CANONICAL[call_start..call_start + 5], "AB1CD");
        assert_eq!(&CANONICAL[comment_start..comment_start + 7], "FN-0042");
        assert_eq!(&CANONICAL[ts_start..], "1234Z");
    }

    #[test]
    fn test_park_code_splits_glued_callsign() {
        let n = normalizer();
        let out = n.format_announcement("DX de K1ABC: 7074.0 N0CALLUS-1234 FT8 1200Z");
        assert_eq!(
            out.as_deref(),
            Some("DX de K1ABC:    7074.0  N0CALL        US-1234 FT8                    1200Z")
        );
    }

    #[test]
    fn test_one_letter_park_prefix_keeps_callsign() {
        let n = normalizer();
        let out = n.format_announcement("DX de K1ABC: 14062.0 W1AWK-1234 CW 1200Z");
        assert_eq!(
            out,
            Some(format!(
                "DX de K1ABC:   14062.0  {:<13} {:<30} 1200Z",
                "W1AW", "K-1234 CW"
            ))
        );
    }

    #[test]
    fn test_two_letter_park_prefix_after_three_letter_suffix() {
        let n = normalizer();
        let out = n.format_announcement("DX de K1ABC: 14062.0 K1ABCVE-0001 SSB 1200Z");
        assert_eq!(
            out,
            Some(format!(
                "DX de K1ABC:   14062.0  {:<13} {:<30} 1200Z",
                "K1ABC", "VE-0001 SSB"
            ))
        );
    }

    #[test]
    fn test_whitespace_split_and_callsign_cleanup() {
        let n = normalizer();
        let out = n.format_announcement("DX de KA9XYZ-#: 14074.0 VE3ABC; POTA VE-0001 ON 0815Z");
        assert_eq!(
            out.as_deref(),
            Some("DX de KA9XYZ-#:   14074.0  VE3ABC        POTA VE-0001 ON                0815Z")
        );
    }

    #[test]
    fn test_announcement_without_timestamp_passes_through() {
        let n = normalizer();
        let line = "DX de W1AW: 14.250 AB1CD no time here";
        assert_eq!(n.normalize(lines(&[line])), lines(&[line]));
    }

    #[test]
    fn test_listing_row_dropped() {
        let n = normalizer();
        let out = n.normalize(lines(&[
            "before",
            "   14.250 AB1CD  05-Jan-2025 1230Z test",
            "after",
        ]));
        assert_eq!(out, lines(&["before", "after"]));
    }

    #[test]
    fn test_listing_row_reformatted_when_not_suppressed() {
        let config = NormalizerConfig {
            suppress_listings: false,
            ..NormalizerConfig::default()
        };
        let n = Normalizer::new(&config).expect("rules compile");
        let out = n.normalize(lines(&["  14250.0 AB1CD.05-Jan-2025 1230Z test"]));
        assert_eq!(out, lines(&["   14250.0  AB1CD         05-Jan-2025 1230Z test"]));
    }

    #[test]
    fn test_classify_line() {
        let n = normalizer();
        assert_eq!(n.classify_line("   "), LineKind::Blank);
        assert_eq!(n.classify_line("DX de W1AW: x"), LineKind::Announcement);
        assert_eq!(n.classify_line("  7.074 K1ABC rest"), LineKind::Listing);
        assert_eq!(n.classify_line("7.074 K1ABC rest"), LineKind::Other);
        assert_eq!(n.classify_line("  1.5 MB free"), LineKind::Other);
    }

    #[test]
    fn test_strip_artifacts() {
        let n = normalizer();
        let out = n.strip_artifacts(lines(&[
            "status line -1234",
            "[80x24] console",
            "text[K",
            "US-1234 stays",
        ]));
        assert_eq!(out, lines(&["status line", " console", "text", "US-1234 stays"]));
    }

    #[test]
    fn test_residue_literal_inside_line_is_content() {
        let n = normalizer();
        let line = "To ALL de W1AW: activating [K-1234] now";
        assert_eq!(n.normalize(lines(&[line])), lines(&[line]));
        assert_eq!(n.strip_artifacts(lines(&["[K-0042] up[K[K  "])), lines(&["[K-0042] up"]));
    }

    #[test]
    fn test_partial_keeps_whitespace() {
        let n = normalizer();
        assert_eq!(n.normalize_partial(" ".to_string()), lines(&[" "]));
        assert_eq!(
            n.normalize_partial("dxspider > ".to_string()),
            lines(&["dxspider > "])
        );
    }

    #[test]
    fn test_split_before_glued_announcement() {
        let n = normalizer();
        let out = n.normalize(lines(&["hello thereDX de W1AW: 14.250 AB1CD FN-0042 1234Z"]));
        assert_eq!(out, lines(&["hello there", CANONICAL]));
    }

    #[test]
    fn test_split_after_prompt() {
        let n = normalizer();
        let out = n.normalize(lines(&["G0ABC de GB7XX 1200Z dxspider >DX de W1AW: 14.250 AB1CD FN-0042 1234Z"]));
        assert_eq!(out, lines(&["G0ABC de GB7XX 1200Z dxspider >", CANONICAL]));

        let echoed = "G0ABC de GB7XX 1200Z dxspider > sh/dx";
        assert_eq!(n.normalize(lines(&[echoed])), lines(&[echoed]));
    }

    #[test]
    fn test_split_after_banner_fragment() {
        let config = NormalizerConfig {
            banner_fragments: vec!["running DXSpider".to_string()],
            ..NormalizerConfig::default()
        };
        let n = Normalizer::new(&config).expect("rules compile");
        let out = n.normalize(lines(&["this is GB7XX running DXSpiderCluster: 3 nodes"]));
        assert_eq!(out, lines(&["this is GB7XX running DXSpider", "Cluster: 3 nodes"]));
    }

    #[test]
    fn test_collapse_blank_runs() {
        assert_eq!(
            collapse_blank_runs(lines(&["a", "", "", "", "b"])),
            lines(&["a", "", "b"])
        );
        assert_eq!(collapse_blank_runs(lines(&["a", "", "b"])), lines(&["a", "", "b"]));
        // Two blank lines are three line breaks
        assert_eq!(
            collapse_blank_runs(lines(&["a", "", "", "b"])),
            lines(&["a", "", "b"])
        );
        assert_eq!(collapse_blank_runs(lines(&["", "", "", "a"])), lines(&["", "", "a"]));
    }

    #[test]
    fn test_normalize_is_idempotent_on_sample() {
        let n = normalizer();
        let once = n.normalize(lines(&[
            "Hello G0ABC, this is GB7XX",
            "",
            "",
            "",
            "DX de W1AW: 14.250 AB1CD FN-0042 1234Z",
            "DX de K1ABC: 7074.0 N0CALLUS-1234 FT8 1200Z",
            "G0ABC de GB7XX dxspider >DX de W1AW: 14.250 AB1CD FN-0042 1234Z",
        ]));
        assert_eq!(n.normalize(once.clone()), once);
    }

    proptest! {
        #[test]
        fn prop_announcement_rewrite_is_fixed_point(
            spotter in "[A-Z0-9]{3,6}",
            freq in "[0-9]{1,5}\\.[0-9]{1,3}",
            call in "[A-Z0-9/]{3,10}",
            comment in "[A-Za-z0-9 ]{0,40}",
            ts in "[0-9]{4}Z",
        ) {
            let n = normalizer();
            let line = format!("DX de {spotter}: {freq} {call} {comment} {ts}");
            let once = n.normalize(vec![line]);
            let twice = n.normalize(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_normalize_never_panics(raw in proptest::collection::vec(".{0,80}", 0..8)) {
            let n = normalizer();
            let _ = n.normalize(raw);
        }
    }
}
