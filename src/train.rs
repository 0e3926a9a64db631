use std::f64;

use anyhow::Result;
use tch::{
    Device, Kind, Tensor,
    nn::{Adam, Optimizer, OptimizerConfig, VarStore},
};
use tracing::info;

use crate::constants::{LEARNING_RATE, MAX_GENERATION_LENGTH, PAD_TOKEN};
use crate::dataset::MelodyDataset;
use crate::generate::MelodyGenerator;
use crate::model::MelodyTransformer;

pub struct MelodyTrainer {
    var_store: VarStore,
    model: MelodyTransformer,
    optimizer: Optimizer,
    dataset: MelodyDataset,
}

impl MelodyTrainer {
    pub fn new(device: Device, dataset: MelodyDataset) -> Result<MelodyTrainer> {
        let var_store = VarStore::new(device);
        let model = MelodyTransformer::new(&var_store.root(), dataset.vocab_size());
        let optimizer = Adam::default().build(&var_store, LEARNING_RATE)?;
        Ok(MelodyTrainer {
            var_store,
            model,
            optimizer,
            dataset,
        })
    }

    // Train the model for the given epochs.
    pub fn train(&mut self, epochs: usize) {
        info!("training the model");
        for epoch in 0..epochs {
            let loss = self.train_epoch(epoch);
            info!("epoch: {}, loss: {}", epoch + 1, loss);
        }
    }

    // Perform one epoch, returning the loss averaged over its batches.
    fn train_epoch(&mut self, epoch: usize) -> f64 {
        let mut total_loss = 0.0;
        let mut batches = 0;
        for (batch, (input, target)) in self.dataset.training_batches().enumerate() {
            batches += 1;
            let batch_loss = self.train_step(&input, &target);
            total_loss += batch_loss;
            info!(
                "epoch {} batch {} loss {}",
                epoch + 1,
                batch + 1,
                batch_loss
            );
        }
        total_loss / batches as f64
    }

    // Perform one training step: forward, masked loss, one optimizer update.
    fn train_step(&mut self, input: &Tensor, target: &Tensor) -> f64 {
        let device = self.var_store.device();
        let input = input.to_device(device);
        let target = target.to_device(device);
        let (decoder_input, decoder_real_target) = shift_for_decoder(&target);
        // Forward through the transformer without encoder/decoder attention
        // masks; the padding mask inside the loss is what keeps padded
        // positions out of the gradients.
        let scores = self
            .model
            .forward(&input, &decoder_input, true, None, None, None);
        let loss = masked_loss(&decoder_real_target, &scores);
        // Backprop gradients, apply one Adam update; optimizer moments persist
        // across steps.
        self.optimizer.backward_step(&loss);
        f64::try_from(&loss).expect("couldn't compute f64 from loss tensor")
    }

    /// Hands the trained parameters and the fitted tokenizer over to a
    /// generator; training and generation never share the model concurrently.
    pub fn into_generator(self) -> MelodyGenerator {
        MelodyGenerator::new(
            self.var_store,
            self.model,
            self.dataset.into_tokenizer(),
            MAX_GENERATION_LENGTH,
        )
    }
}

/// Derives the decoder's input and real target from a `[batch, length]`
/// target batch: input drops the last token, the real target drops the
/// first, and both are right-padded by one zero so each keeps the
/// original length. Position i of the input (token i of the target) then
/// lines up with position i of the real target (token i+1).
pub fn shift_for_decoder(target: &Tensor) -> (Tensor, Tensor) {
    let length = target.size()[1];
    let decoder_input = right_pad_sequence_once(&target.narrow(1, 0, length - 1));
    let decoder_real_target = right_pad_sequence_once(&target.narrow(1, 1, length - 1));
    (decoder_input, decoder_real_target)
}

// Pads a [batch, length] sequence batch with a single zero column at the end.
fn right_pad_sequence_once(sequence: &Tensor) -> Tensor {
    let batch = sequence.size()[0];
    let zeros = Tensor::zeros(&[batch, 1], (Kind::Int64, sequence.device()));
    Tensor::cat(&[sequence, &zeros], 1)
}

/// Average categorical cross-entropy between real target token IDs
/// `[batch, length]` and predicted raw logits `[batch, length, vocab]`,
/// counting only non-padding positions.
///
/// Callers must guarantee at least one non-padding position per batch;
/// an all-padding batch divides by zero.
pub fn masked_loss(real: &Tensor, pred: &Tensor) -> Tensor {
    // log_softmax keeps the log-sum-exp over the vocab dimension stable for
    // large-magnitude logits; gathering at the target ID yields the
    // per-position cross-entropy [batch, length]
    let log_probs = pred.log_softmax(-1, Kind::Float);
    let per_position = -log_probs
        .gather(-1, &real.unsqueeze(-1), false)
        .squeeze_dim(-1);
    // 1.0 at real positions, 0.0 at padding
    let mask = real.ne(PAD_TOKEN).to_kind(Kind::Float);
    let total_loss = (per_position * &mask).sum(Kind::Float);
    let non_padded_positions = mask.sum(Kind::Float);
    total_loss / non_padded_positions
}
