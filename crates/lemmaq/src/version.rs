//! Version information for lemmaq.

use crate::config::AnalyzerCommand;
use crate::protocol::{DOC_LEN_MAX, SLOT_TEXT_CAPACITY};
use crate::shm::table::LAYOUT_VERSION;

/// lemmaq version from Cargo.toml
pub const LEMMAQ_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub lemmaq: &'static str,
    /// Shared table layout revision; processes must agree on it to attach.
    pub layout: u64,
    pub doc_len_max: usize,
    pub slot_bytes: usize,
    /// Analyzer this deployment is configured to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            lemmaq: LEMMAQ_VERSION,
            layout: LAYOUT_VERSION,
            doc_len_max: DOC_LEN_MAX,
            slot_bytes: SLOT_TEXT_CAPACITY,
            analyzer: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analyzer(mut self, analyzer: &AnalyzerCommand) -> Self {
        let mut line = analyzer.program.display().to_string();
        for arg in &analyzer.args {
            line.push(' ');
            line.push_str(arg);
        }
        self.analyzer = Some(line);
        self
    }
}
