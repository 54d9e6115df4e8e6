//! Streaming decoder for analyzer output.
//!
//! Turns line-delimited JSON token records into one normalized string: the
//! lemma of every analyzed token, the raw text of everything else. Decoding is
//! best effort; malformed input is logged and skipped, never fatal.

use crate::protocol::{SENTINEL, TokenRecord};

/// Whether decoding should continue after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The sentinel record was seen; later input belongs to no document.
    Finished,
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    output: String,
    finished: bool,
    skipped: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one response line.
    pub fn feed(&mut self, line: &str) -> Flow {
        if self.finished {
            return Flow::Finished;
        }

        let records: Vec<serde_json::Value> = match serde_json::from_str(line) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, line = %preview(line), "Skipping undecodable analyzer line");
                self.skipped += 1;
                return Flow::Continue;
            }
        };

        for value in records {
            let record: TokenRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed token record, skipping rest of line");
                    self.skipped += 1;
                    break;
                }
            };

            let Some(text) = record.text else {
                tracing::warn!("Token record without text, skipping rest of line");
                self.skipped += 1;
                break;
            };

            if text == SENTINEL {
                self.finished = true;
                return Flow::Finished;
            }

            match record.analysis.as_deref().and_then(last_lemma) {
                Some(lemma) => self.output.push_str(lemma),
                None if text == "\n" => {}
                None => self.output.push_str(&text.replace('\n', " ")),
            }
        }

        Flow::Continue
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Records or lines dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn finish(self) -> String {
        self.output
    }
}

/// Lemma of the last analysis entry. An entry without a lemma ends the scan,
/// keeping whatever was found before it.
fn last_lemma(analysis: &[crate::protocol::Analysis]) -> Option<&str> {
    let mut lemma = None;
    for entry in analysis {
        match entry.lex.as_deref() {
            Some(lex) => lemma = Some(lex),
            None => {
                tracing::warn!("Analysis entry without lex");
                break;
            }
        }
    }
    lemma.filter(|lex| !lex.is_empty())
}

/// Decode a complete response.
pub fn decode_lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut decoder = StreamDecoder::new();
    for line in lines {
        if decoder.feed(line.as_ref()) == Flow::Finished {
            break;
        }
    }
    decoder.finish()
}

fn preview(line: &str) -> &str {
    crate::queue::truncate_at_boundary(line, 120)
}
