use anyhow::Result;
use tch::{IndexOp, Tensor, nn::VarStore};

use crate::model::MelodyTransformer;
use crate::tokenizer::Tokenizer;

/// Wraps a trained transformer and its tokenizer to compose melodies by
/// greedy autoregressive decoding. Only reads model parameters; callers must
/// not run generation concurrently with an in-progress training step.
pub struct MelodyGenerator {
    var_store: VarStore,
    model: MelodyTransformer,
    tokenizer: Tokenizer,
    max_length: usize,
}

impl MelodyGenerator {
    pub fn new(
        var_store: VarStore,
        model: MelodyTransformer,
        tokenizer: Tokenizer,
        max_length: usize,
    ) -> MelodyGenerator {
        MelodyGenerator {
            var_store,
            model,
            tokenizer,
            max_length,
        }
    }

    /// Extends the seed to `max_length` tokens, one arg-max token per model
    /// call, and decodes the result. A seed already at or past `max_length`
    /// comes back decoded unchanged without touching the model. The seed must
    /// not be empty.
    pub fn generate(&self, seed: &[String]) -> Result<String> {
        let seed_tokens = self.tokenizer.encode(seed)?;
        let generated = self.extend_sequence(seed_tokens);
        self.tokenizer.decode(&generated)
    }

    fn extend_sequence(&self, seed_tokens: Vec<i64>) -> Vec<i64> {
        // Disable gradient tracking since we're not training now.
        let _no_grad_guard = tch::no_grad_guard();
        let device = self.var_store.device();
        // [seq_len] -> [1, seq_len]
        let mut sequence = Tensor::from_slice(&seed_tokens)
            .to_device(device)
            .unsqueeze(0);

        let notes_to_generate = self.max_length.saturating_sub(seed_tokens.len());
        for _ in 0..notes_to_generate {
            // The growing sequence conditions both sides of the model; no
            // target shifting and no attention masks during inference
            let scores = self
                .model
                .forward(&sequence, &sequence, false, None, None, None);
            // Scores at the last position predict the next token: [vocab]
            let last_scores = scores.i((0, -1, ..));
            // Greedy selection, no sampling
            let next_token = last_scores.argmax(-1, false);
            sequence = Tensor::cat(&[&sequence, &next_token.view([1, 1])], 1);
        }

        Vec::<i64>::try_from(&sequence.view([-1])).expect("couldn't read sequence tokens back")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn seed_events() -> Vec<String> {
        vec!["C4-1.0", "D4-1.0", "E4-1.0", "C4-1.0"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn setup_generator(max_length: usize) -> MelodyGenerator {
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&[
            seed_events(),
            vec!["F4-1.0", "G4-1.0", "E4-0.5", "D4-0.5"]
                .into_iter()
                .map(String::from)
                .collect(),
        ]);
        let var_store = VarStore::new(Device::Cpu);
        let model = MelodyTransformer::new(&var_store.root(), tokenizer.vocab_size());
        MelodyGenerator::new(var_store, model, tokenizer, max_length)
    }

    #[test]
    fn test_seed_at_max_length_comes_back_unchanged() {
        let generator = setup_generator(4);
        let melody = generator.generate(&seed_events()).unwrap();
        assert_eq!(melody, "C4-1.0 D4-1.0 E4-1.0 C4-1.0");
    }

    #[test]
    fn test_seed_past_max_length_comes_back_unchanged() {
        let generator = setup_generator(2);
        let melody = generator.generate(&seed_events()).unwrap();
        assert_eq!(melody, "C4-1.0 D4-1.0 E4-1.0 C4-1.0");
    }

    #[test]
    fn test_sequence_grows_by_exactly_the_remaining_length() {
        let generator = setup_generator(7);
        let seed_tokens = generator.tokenizer.encode(&seed_events()).unwrap();
        let generated = generator.extend_sequence(seed_tokens.clone());
        assert_eq!(generated.len(), 7);
        assert_eq!(&generated[..4], &seed_tokens[..]);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let generator = setup_generator(10);
        let first = generator.generate(&seed_events()).unwrap();
        let second = generator.generate(&seed_events()).unwrap();
        assert_eq!(first, second);

        let seed_tokens = generator.tokenizer.encode(&seed_events()).unwrap();
        let tokens_a = generator.extend_sequence(seed_tokens.clone());
        let tokens_b = generator.extend_sequence(seed_tokens);
        assert_eq!(tokens_a, tokens_b);
    }

    #[test]
    fn test_four_seed_notes_to_eight_tokens() {
        let generator = setup_generator(8);
        let seed_tokens = generator.tokenizer.encode(&seed_events()).unwrap();
        let generated = generator.extend_sequence(seed_tokens.clone());
        // Four decoding iterations extend the four seed tokens to eight
        assert_eq!(generated.len(), 8);
        assert_eq!(&generated[..4], &seed_tokens[..]);
        let melody = generator.generate(&seed_events()).unwrap();
        assert!(melody.starts_with("C4-1.0 D4-1.0 E4-1.0 C4-1.0"));
    }

    #[test]
    fn test_unknown_seed_event_is_an_error() {
        let generator = setup_generator(8);
        let result = generator.generate(&["Z9-9.9".to_string()]);
        assert!(result.is_err());
    }
}
