//! Minimal stand-in for the external analyzer, speaking the same line
//! protocol. Used by `lemmaq analyzer-stub` for tests and local runs without
//! the real analyzer installed.
//!
//! Words are runs of alphabetic characters. A word's lemma is its lowercase
//! form with a plural `s` dropped; everything else is passed through as plain
//! text.

use std::io::{self, BufRead, Write};

use crate::protocol::{SENTINEL, TokenRecord};

/// Answer each input line with one JSON array line until `input` ends.
pub fn run_stub<R: BufRead, W: Write>(mut input: R, mut output: W) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }
        serde_json::to_writer(&mut output, &analyze_line(&line))?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
}

pub fn analyze_line(line: &str) -> Vec<TokenRecord> {
    let mut records = Vec::new();
    let mut rest = line;
    while let Some(first) = rest.chars().next() {
        let len = if first == '\n' {
            1
        } else {
            let alphabetic = first.is_alphabetic();
            rest.find(|c: char| c == '\n' || c.is_alphabetic() != alphabetic)
                .unwrap_or(rest.len())
        };
        let (token, tail) = rest.split_at(len);
        records.push(record_for(token));
        rest = tail;
    }
    records
}

fn record_for(token: &str) -> TokenRecord {
    let is_word = token.chars().next().is_some_and(char::is_alphabetic);
    if !is_word || token == SENTINEL {
        return TokenRecord::plain(token);
    }
    TokenRecord::analyzed(token, lemma(token))
}

fn lemma(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.chars().count() > 3 && lower.ends_with('s') && !lower.ends_with("ss") {
        lower[..lower.len() - 1].to_string()
    } else {
        lower
    }
}
