//! Path/identifier tokenizer.
//!
//! Rules: ASCII letter/digit runs form tokens; `+` joins onto the run
//! instead of splitting it (so `c++` stays whole); every `.` is a hard
//! boundary (so `foo.tar.gz` splits into `foo`, `tar`, `gz`); every CJK
//! character is its own token; a short stopword list is dropped after
//! splitting.

use tantivy::tokenizer::{BoxTokenStream, Token, TokenStream, Tokenizer};

pub const TOKENIZER_NAME: &str = "anything_path";

const STOPWORDS: &[&str] = &["a", "an", "the", "of", "and", "or", "to", "in", "on"];

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x3040..=0x30FF)
}

fn is_run_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+'
}

/// Splits `text` into raw (token, byte_start, byte_end) spans, without
/// applying the stopword filter. Exposed separately so callers needing
/// offsets (the tantivy `TokenStream`) and callers needing only strings
/// (pinyin expansion, tests) share one implementation.
pub fn tokenize_with_offsets(text: &str) -> Vec<(String, usize, usize)> {
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;

    let flush = |run_start: &mut Option<usize>, end: usize, out: &mut Vec<(String, usize, usize)>| {
        if let Some(start) = run_start.take() {
            if end > start {
                out.push((text[start..end].to_string(), start, end));
            }
        }
    };

    for (idx, ch) in text.char_indices() {
        if is_cjk(ch) {
            flush(&mut run_start, idx, &mut out);
            let end = idx + ch.len_utf8();
            out.push((ch.to_string(), idx, end));
            continue;
        }
        if is_run_char(ch) {
            if run_start.is_none() {
                run_start = Some(idx);
            }
        } else {
            flush(&mut run_start, idx, &mut out);
        }
    }
    flush(&mut run_start, text.len(), &mut out);
    out
}

/// Tokenizes `text` into lowercase terms with the stopword filter applied.
pub fn tokenize(text: &str) -> Vec<String> {
    tokenize_with_offsets(text)
        .into_iter()
        .map(|(tok, _, _)| tok.to_lowercase())
        .filter(|tok| !tok.is_empty() && !STOPWORDS.contains(&tok.as_str()))
        .collect()
}

#[derive(Clone, Default)]
pub struct PathTokenizer;

pub struct PathTokenStream {
    tokens: Vec<Token>,
    index: usize,
}

impl TokenStream for PathTokenStream {
    fn advance(&mut self) -> bool {
        if self.index >= self.tokens.len() {
            return false;
        }
        self.index += 1;
        true
    }

    fn token(&self) -> &Token {
        &self.tokens[self.index - 1]
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.tokens[self.index - 1]
    }
}

impl Tokenizer for PathTokenizer {
    fn token_stream<'a>(&self, text: &'a str) -> BoxTokenStream<'a> {
        let tokens = tokenize_with_offsets(text)
            .into_iter()
            .enumerate()
            .filter_map(|(position, (tok, start, end))| {
                let lower = tok.to_lowercase();
                if lower.is_empty() || STOPWORDS.contains(&lower.as_str()) {
                    return None;
                }
                Some(Token {
                    offset_from: start,
                    offset_to: end,
                    position,
                    text: lower,
                    position_length: 1,
                })
            })
            .collect();
        BoxTokenStream::from(PathTokenStream { tokens, index: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_ascii_runs_on_punctuation() {
        assert_eq!(tokenize("my_report-final"), vec!["my", "report", "final"]);
    }

    #[test]
    fn keeps_plus_joined_runs_together() {
        assert_eq!(tokenize("c++ notes"), vec!["c++", "notes"]);
    }

    #[test]
    fn every_dot_is_a_boundary() {
        assert_eq!(tokenize("foo.tar.gz"), vec!["foo", "tar", "gz"]);
        assert_eq!(tokenize("archive.v1.2.tar.gz"), vec!["archive", "v1", "2", "tar", "gz"]);
    }

    #[test]
    fn each_cjk_character_is_its_own_token() {
        assert_eq!(tokenize("报告.doc"), vec!["报", "告", "doc"]);
    }

    #[test]
    fn stopwords_are_dropped() {
        assert_eq!(tokenize("the plan of record"), vec!["plan", "record"]);
    }
}
