//! # FASTA Reader
//!
//! Reads nucleotide alignments. The record name is the first word of the
//! header line; sequence lines are concatenated.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info_span;

use crate::data::CharacterMatrix;

/// Read `(name, sequence)` records.
pub fn parse_fasta<R: BufRead>(reader: R) -> Result<Vec<(String, String)>> {
    let mut records: Vec<(String, String)> = Vec::new();
    let mut seen = HashSet::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let name = header.split_whitespace().next().unwrap_or_default();
            if name.is_empty() {
                bail!("line {}: empty sequence name", line_num + 1);
            }
            if !seen.insert(name.to_string()) {
                bail!("line {}: duplicate sequence name {}", line_num + 1, name);
            }
            records.push((name.to_string(), String::new()));
        } else {
            match records.last_mut() {
                Some((_, seq)) => seq.extend(line.chars().filter(|c| !c.is_whitespace())),
                None => bail!("line {}: sequence data before the first header", line_num + 1),
            }
        }
    }

    if records.is_empty() {
        bail!("no sequences found");
    }
    Ok(records)
}

/// Read a FASTA file (optionally gzipped) into a nucleotide matrix.
pub fn read_alignment(path: &Path) -> Result<CharacterMatrix> {
    info_span!("read_alignment", path = ?path).in_scope(|| {
        let reader = super::open_text(path)?;
        let records = parse_fasta(reader)
            .with_context(|| format!("Failed to parse FASTA file {}", path.display()))?;
        let matrix = CharacterMatrix::from_dna(&records)
            .with_context(|| format!("Invalid alignment in {}", path.display()))?;
        tracing::debug!(taxa = matrix.n_taxa(), sites = matrix.n_sites(), "alignment loaded");
        Ok(matrix)
    })
}
