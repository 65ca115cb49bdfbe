use std::sync::Arc;

use crate::compressor::{Compressor, DEFAULT_KNOWN_TX_CAPACITY};
use crate::version::COMPRESSOR_CONFIGS;

/// The three compressor instances the orchestrator constructs, one per
/// distinct `(use_flags_and_smaller_max, freeze_indexes_during_block)` pair.
#[derive(Debug)]
pub struct CompressorSet {
    compressors: [Arc<Compressor>; 3],
}

impl CompressorSet {
    pub fn new() -> Self {
        Self::with_known_tx_capacity(DEFAULT_KNOWN_TX_CAPACITY)
    }

    pub fn with_known_tx_capacity(known_tx_capacity: usize) -> Self {
        Self {
            compressors: COMPRESSOR_CONFIGS
                .map(|config| Arc::new(Compressor::new(config, known_tx_capacity))),
        }
    }

    pub fn get(&self, index: usize) -> &Arc<Compressor> {
        &self.compressors[index]
    }

    pub fn len(&self) -> usize {
        self.compressors.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<Compressor>)> {
        self.compressors.iter().enumerate()
    }
}

impl Default for CompressorSet {
    fn default() -> Self {
        Self::new()
    }
}
