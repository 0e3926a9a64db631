/// Number of complete passes over the training dataset.
pub const EPOCHS: usize = 10;
/// Number of (input, target) sequence pairs per training batch.
pub const BATCH_SIZE: usize = 32;
/// Total length of a generated melody in tokens, seed included.
pub const MAX_GENERATION_LENGTH: usize = 50;
/// Directory scanned for melody corpus files.
pub const DATA_DIR: &str = "data/";

/// Token ID reserved for padding; never assigned to an event and excluded from the loss.
pub const PAD_TOKEN: i64 = 0;

/// Number of encoder layers and, equally, decoder layers.
pub const NUM_LAYERS: usize = 2;
/// The number of dimensions in the embedding space.
pub const D_MODEL: i64 = 64;
/// The number of "heads" (attention passes).
pub const NUM_HEADS: i64 = 2;
/// The "hidden" dimension for the feed-forward network.
pub const D_FEEDFORWARD: i64 = 128;
/// Dropout probability applied during training forward passes.
pub const DROPOUT_RATE: f64 = 0.1;
/// Upper bound on sequence positions in the sinusoidal position table.
pub const MAX_POSITIONS: i64 = 100;

/// Adam learning rate.
pub const LEARNING_RATE: f64 = 1e-3;
/// The fraction of melodies used for training; the rest is held out for validation.
pub const TRAIN_VALIDATION_SPLIT: f32 = 0.9;
