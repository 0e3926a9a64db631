use anyhow::{Context, Result};
use tch::Tensor;

use crate::constants::{BATCH_SIZE, PAD_TOKEN, TRAIN_VALIDATION_SPLIT};
use crate::tokenizer::Tokenizer;

/// Melody corpus prepared for next-token training.
///
/// Loads every `.json` file under a data directory (each a JSON array of
/// melody strings, events separated by commas), fits the tokenizer on the
/// full corpus, and expands each melody into sliding prefix pairs: for every
/// split point i, input = melody[..i] and target = melody[1..=i], both
/// right-padded with zeros to the longest melody length.
#[derive(Debug)]
pub struct MelodyDataset {
    tokenizer: Tokenizer,
    max_melody_length: usize,
    training: BatchSet,
    validation: BatchSet,
}

impl MelodyDataset {
    pub fn new(data_dir: &str) -> Result<Self> {
        let melodies = Self::load_melodies(data_dir)?;
        if melodies.is_empty() {
            return Err(anyhow::anyhow!("No melodies found under {}", data_dir));
        }

        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&melodies);
        let encoded: Vec<Vec<i64>> = melodies
            .iter()
            .map(|melody| tokenizer.encode(melody))
            .collect::<Result<_>>()?;
        let max_melody_length = encoded.iter().map(Vec::len).max().unwrap_or(0);

        // Split whole melodies between training and validation so no
        // validation prefix ever appears in the training pairs.
        let mut training_pairs = Vec::new();
        let mut validation_pairs = Vec::new();
        for melody in &encoded {
            let pairs = sequence_pairs(melody, max_melody_length);
            if rand::random::<f32>() < TRAIN_VALIDATION_SPLIT {
                training_pairs.extend(pairs);
            } else {
                validation_pairs.extend(pairs);
            }
        }

        Ok(MelodyDataset {
            tokenizer,
            max_melody_length,
            training: BatchSet::new(training_pairs, BATCH_SIZE),
            validation: BatchSet::new(validation_pairs, BATCH_SIZE),
        })
    }

    fn load_melodies(data_dir: &str) -> Result<Vec<Vec<String>>> {
        let mut melodies = Vec::new();
        for entry in walkdir::WalkDir::new(data_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        {
            let text = std::fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            let raw: Vec<String> = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", entry.path().display()))?;
            for melody in raw {
                let events: Vec<String> = melody
                    .split(',')
                    .map(|event| event.trim().to_string())
                    .filter(|event| !event.is_empty())
                    .collect();
                if !events.is_empty() {
                    melodies.push(events);
                }
            }
        }
        Ok(melodies)
    }

    pub fn into_tokenizer(self) -> Tokenizer {
        self.tokenizer
    }

    pub fn vocab_size(&self) -> i64 {
        self.tokenizer.vocab_size()
    }

    /// Length every sequence pair is padded to.
    pub fn max_melody_length(&self) -> usize {
        self.max_melody_length
    }

    pub fn training_batches(&self) -> BatchSet {
        self.training.clone()
    }

    pub fn validation_batches(&self) -> BatchSet {
        self.validation.clone()
    }
}

/// Expands one encoded melody into (input, target) prefix pairs, each
/// right-padded with the padding sentinel to `padded_length`.
fn sequence_pairs(melody: &[i64], padded_length: usize) -> Vec<(Vec<i64>, Vec<i64>)> {
    (1..melody.len())
        .map(|i| {
            let mut input = melody[..i].to_vec();
            let mut target = melody[1..=i].to_vec();
            input.resize(padded_length, PAD_TOKEN);
            target.resize(padded_length, PAD_TOKEN);
            (input, target)
        })
        .collect()
}

/// One epoch's worth of batches; clone the set to replay it for the next epoch.
#[derive(Debug, Clone)]
pub struct BatchSet {
    pairs: Vec<(Vec<i64>, Vec<i64>)>,
    batch_size: usize,
}

impl BatchSet {
    fn new(pairs: Vec<(Vec<i64>, Vec<i64>)>, batch_size: usize) -> Self {
        BatchSet { pairs, batch_size }
    }

    /// Remaining (input, target) pairs, across all batches left to yield.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Iterator for BatchSet {
    type Item = (Tensor, Tensor); // (input, target), each [batch, length]

    fn next(&mut self) -> Option<Self::Item> {
        if self.pairs.is_empty() {
            return None;
        }
        // The final batch may be smaller than batch_size
        let take = self.pairs.len().min(self.batch_size);
        let batch: Vec<(Vec<i64>, Vec<i64>)> = self.pairs.drain(..take).collect();
        let inputs: Vec<Tensor> = batch
            .iter()
            .map(|(input, _)| Tensor::from_slice(input))
            .collect();
        let targets: Vec<Tensor> = batch
            .iter()
            .map(|(_, target)| Tensor::from_slice(target))
            .collect();
        Some((Tensor::stack(&inputs, 0), Tensor::stack(&targets, 0)))
    }
}
