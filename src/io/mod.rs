//! # I/O Module
//!
//! File reading boundaries. Converts Newick trees and FASTA alignments into
//! the in-memory `Tree` and `CharacterMatrix` representations.

pub mod fasta;
pub mod newick;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;

/// Open a text file, decompressing it when the name ends in `.gz`.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let is_gzipped = path
        .extension()
        .map(|e| e == "gz" || e == "bgz")
        .unwrap_or(false);

    let reader: Box<dyn BufRead + Send> = if is_gzipped {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}
