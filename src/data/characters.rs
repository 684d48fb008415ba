//! # Character Matrix
//!
//! Observed discrete characters, one row per taxon, one column per site.
//! Each cell is a gap, a single state or a set of candidate states.
//!
//! The matrix validates every cell against the state-space size once, when
//! it is built. Per-site weights carry pattern multiplicities; a weight of
//! zero masks a site out of the likelihood.

use std::collections::{HashMap, HashSet};

use crate::error::{FelsenError, Result};

/// Largest supported state space (bits in `StateSet`).
pub const MAX_STATES: usize = 32;

/// Set of states encoded as a bitmask, bit `i` = state `i`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct StateSet(u32);

impl StateSet {
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn from_states(states: &[u8]) -> Self {
        Self(states.iter().fold(0u32, |acc, &s| acc | 1u32.checked_shl(s as u32).unwrap_or(0)))
    }

    /// All states of an `n`-state alphabet.
    pub fn full(n_states: usize) -> Self {
        if n_states >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << n_states) - 1)
        }
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, state: usize) -> bool {
        state < 32 && self.0 & (1 << state) != 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Member states in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |&s| self.0 & (1 << s) != 0)
    }
}

/// One observed cell of the character matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Observation {
    /// Missing data; contributes a factor of one for every state.
    Gap,
    State(u8),
    Ambiguous(StateSet),
}

impl Observation {
    /// Translate an IUPAC nucleotide code (A=0, C=1, G=2, T/U=3).
    pub fn from_nucleotide(code: char) -> Option<Self> {
        let obs = match code.to_ascii_uppercase() {
            'A' => Self::State(0),
            'C' => Self::State(1),
            'G' => Self::State(2),
            'T' | 'U' => Self::State(3),
            'R' => Self::Ambiguous(StateSet::from_states(&[0, 2])),
            'Y' => Self::Ambiguous(StateSet::from_states(&[1, 3])),
            'S' => Self::Ambiguous(StateSet::from_states(&[1, 2])),
            'W' => Self::Ambiguous(StateSet::from_states(&[0, 3])),
            'K' => Self::Ambiguous(StateSet::from_states(&[2, 3])),
            'M' => Self::Ambiguous(StateSet::from_states(&[0, 1])),
            'B' => Self::Ambiguous(StateSet::from_states(&[1, 2, 3])),
            'D' => Self::Ambiguous(StateSet::from_states(&[0, 2, 3])),
            'H' => Self::Ambiguous(StateSet::from_states(&[0, 1, 3])),
            'V' => Self::Ambiguous(StateSet::from_states(&[0, 1, 2])),
            'N' => Self::Ambiguous(StateSet::full(4)),
            '-' | '?' | '.' => Self::Gap,
            _ => return None,
        };
        Some(obs)
    }

    pub fn is_gap(self) -> bool {
        matches!(self, Self::Gap)
    }

    fn check(self, n_states: usize) -> std::result::Result<(), String> {
        match self {
            Self::Gap => Ok(()),
            Self::State(s) if (s as usize) < n_states => Ok(()),
            Self::State(s) => Err(format!("state code {} outside 0..{}", s, n_states)),
            Self::Ambiguous(set) if set.is_empty() => Err("empty ambiguity set".to_string()),
            Self::Ambiguous(set) if set.bits() & !StateSet::full(n_states).bits() != 0 => Err(
                format!("ambiguity set {:#b} names states outside 0..{}", set.bits(), n_states),
            ),
            Self::Ambiguous(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CharacterMatrix {
    n_states: usize,
    taxa: Vec<String>,
    /// rows[taxon][site]
    rows: Vec<Vec<Observation>>,
    site_weights: Vec<f64>,
}

impl CharacterMatrix {
    /// Build and validate a matrix. Every site starts with weight one.
    pub fn new(n_states: usize, taxa: Vec<String>, rows: Vec<Vec<Observation>>) -> Result<Self> {
        if n_states == 0 || n_states > MAX_STATES {
            return Err(FelsenError::invalid_data(format!(
                "state space of size {} not supported",
                n_states
            )));
        }
        if taxa.len() != rows.len() {
            return Err(FelsenError::invalid_data(format!(
                "{} taxon names for {} rows",
                taxa.len(),
                rows.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = taxa.iter().find(|t| !seen.insert(t.as_str())) {
            return Err(FelsenError::invalid_data(format!(
                "taxon {} appears more than once",
                dup
            )));
        }
        let n_sites = rows.first().map_or(0, Vec::len);
        for (taxon, row) in taxa.iter().zip(&rows) {
            if row.len() != n_sites {
                return Err(FelsenError::invalid_data(format!(
                    "taxon {} has {} sites, expected {}",
                    taxon,
                    row.len(),
                    n_sites
                )));
            }
            for (site, obs) in row.iter().enumerate() {
                obs.check(n_states).map_err(|msg| {
                    FelsenError::invalid_data(format!("taxon {}, site {}: {}", taxon, site + 1, msg))
                })?;
            }
        }

        Ok(Self {
            n_states,
            taxa,
            rows,
            site_weights: vec![1.0; n_sites],
        })
    }

    /// Build a nucleotide matrix from `(name, sequence)` pairs.
    pub fn from_dna<S: AsRef<str>>(sequences: &[(S, S)]) -> Result<Self> {
        let mut taxa = Vec::with_capacity(sequences.len());
        let mut rows = Vec::with_capacity(sequences.len());
        for (name, seq) in sequences {
            let name = name.as_ref();
            let row = seq
                .as_ref()
                .chars()
                .filter(|c| !c.is_whitespace())
                .enumerate()
                .map(|(site, c)| {
                    Observation::from_nucleotide(c).ok_or_else(|| {
                        FelsenError::invalid_data(format!(
                            "taxon {}, site {}: unknown nucleotide code '{}'",
                            name,
                            site + 1,
                            c
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            taxa.push(name.to_string());
            rows.push(row);
        }
        Self::new(4, taxa, rows)
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_taxa(&self) -> usize {
        self.taxa.len()
    }

    pub fn n_sites(&self) -> usize {
        self.site_weights.len()
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.taxa.iter().position(|t| t == name)
    }

    pub fn row(&self, taxon: usize) -> &[Observation] {
        &self.rows[taxon]
    }

    pub fn site_weights(&self) -> &[f64] {
        &self.site_weights
    }

    /// Replace the per-site weights.
    pub fn with_site_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.n_sites() {
            return Err(FelsenError::invalid_data(format!(
                "{} weights for {} sites",
                weights.len(),
                self.n_sites()
            )));
        }
        if let Some(w) = weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
            return Err(FelsenError::invalid_data(format!("invalid site weight {}", w)));
        }
        self.site_weights = weights;
        Ok(self)
    }

    /// Exclude a site from the likelihood.
    pub fn mask_site(&mut self, site: usize) -> Result<()> {
        let w = self
            .site_weights
            .get_mut(site)
            .ok_or_else(|| FelsenError::invalid_data(format!("no site {}", site)))?;
        *w = 0.0;
        Ok(())
    }

    /// Merge identical columns, summing their weights.
    ///
    /// Patterns keep the order of their first occurrence. Masked columns
    /// are dropped.
    pub fn compress_patterns(&self) -> Self {
        let n_sites = self.n_sites();
        let mut index: HashMap<Vec<Observation>, usize> = HashMap::new();
        let mut pattern_sites = Vec::new();
        let mut weights: Vec<f64> = Vec::new();

        for site in 0..n_sites {
            let weight = self.site_weights[site];
            if weight == 0.0 {
                continue;
            }
            let column: Vec<Observation> = self.rows.iter().map(|row| row[site]).collect();
            match index.get(&column) {
                Some(&p) => weights[p] += weight,
                None => {
                    index.insert(column, weights.len());
                    pattern_sites.push(site);
                    weights.push(weight);
                }
            }
        }

        let rows = self
            .rows
            .iter()
            .map(|row| pattern_sites.iter().map(|&s| row[s]).collect())
            .collect();

        Self {
            n_states: self.n_states,
            taxa: self.taxa.clone(),
            rows,
            site_weights: weights,
        }
    }

    /// Weighted state frequencies over all observed cells.
    ///
    /// Ambiguous cells spread their count evenly over their states; gaps are
    /// ignored. An alignment with no informative cells gives uniform
    /// frequencies.
    pub fn empirical_frequencies(&self) -> Vec<f64> {
        let mut counts = vec![0.0; self.n_states];
        for row in &self.rows {
            for (obs, &w) in row.iter().zip(&self.site_weights) {
                match *obs {
                    Observation::Gap => {}
                    Observation::State(s) => counts[s as usize] += w,
                    Observation::Ambiguous(set) => {
                        let share = w / set.len() as f64;
                        for s in set.iter() {
                            counts[s] += share;
                        }
                    }
                }
            }
        }
        let total: f64 = counts.iter().sum();
        if total <= 0.0 {
            return vec![1.0 / self.n_states as f64; self.n_states];
        }
        counts.iter().map(|c| c / total).collect()
    }
}
