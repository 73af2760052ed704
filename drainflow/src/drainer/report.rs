//! Per-round reports and cross-round residue statistics.

use super::DrainKind;
use crate::core::{DrainData, Token};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use uuid::Uuid;

/// Summary of one finished drain round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Unique id of the round.
    pub round_id: Uuid,
    /// The kind that was requested.
    pub kind: DrainKind,
    /// When the request was accepted.
    pub started_at: DateTime<Utc>,
    /// When the round's data phase finished.
    pub finished_at: DateTime<Utc>,
    /// Wall time of the round.
    pub duration_ms: u64,
    /// Units the watchdog forced to completion.
    #[serde(default)]
    pub forced_units: Vec<Token>,
    /// Items in the merged drain data. Zero when data was not collected.
    #[serde(default)]
    pub residue_items: usize,
}

impl DrainReport {
    /// Returns true if no unit had to be forced.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.forced_units.is_empty()
    }
}

/// History of residue sizes per token, one entry per recorded round.
#[derive(Debug, Default)]
pub struct DrainStatistics {
    sizes: DashMap<Token, Vec<usize>>,
}

impl DrainStatistics {
    /// Creates empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the residue size of every token in `data`.
    pub fn record(&self, data: &DrainData) {
        for (token, items) in data.data() {
            self.sizes.entry(*token).or_default().push(items.len());
        }
    }

    /// Recorded sizes for one token, oldest first.
    #[must_use]
    pub fn sizes(&self, token: Token) -> Vec<usize> {
        self.sizes
            .get(&token)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Tokens with at least one recorded size, sorted.
    #[must_use]
    pub fn tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.sizes.iter().map(|entry| *entry.key()).collect();
        tokens.sort_unstable();
        tokens
    }

    /// Writes one line per token: the token followed by its sizes.
    pub fn dump(&self, writer: &mut impl Write) -> io::Result<()> {
        for token in self.tokens() {
            let sizes = self
                .sizes(token)
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(writer, "{token}: {sizes}")?;
        }
        writer.flush()
    }
}
