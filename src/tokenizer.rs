use std::collections::HashMap;

use anyhow::Result;

use crate::constants::PAD_TOKEN;

/// Maps musical event strings (e.g. "C4-1.0") to integer token IDs and back.
///
/// IDs are assigned from 1 upward when the tokenizer is fitted to a corpus;
/// 0 is never assigned because it is reserved for padding.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    token_to_id: HashMap<String, i64>,
    id_to_token: Vec<String>,
}

impl Tokenizer {
    pub fn new() -> Self {
        Tokenizer::default()
    }

    /// Builds the vocabulary from a corpus of melodies. Events get IDs in
    /// descending frequency order; ties keep first-appearance order.
    pub fn fit(&mut self, melodies: &[Vec<String>]) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut first_seen: Vec<&str> = Vec::new();
        for melody in melodies {
            for event in melody {
                let count = counts.entry(event.as_str()).or_insert_with(|| {
                    first_seen.push(event.as_str());
                    0
                });
                *count += 1;
            }
        }
        let mut ordered = first_seen;
        // Stable sort keeps first-appearance order among equally frequent events
        ordered.sort_by_key(|event| std::cmp::Reverse(counts[*event]));

        self.token_to_id = HashMap::with_capacity(ordered.len());
        self.id_to_token = Vec::with_capacity(ordered.len());
        for (index, event) in ordered.into_iter().enumerate() {
            // IDs start at 1; 0 stays the padding sentinel
            self.token_to_id.insert(event.to_string(), index as i64 + 1);
            self.id_to_token.push(event.to_string());
        }
    }

    pub fn encode(&self, events: &[String]) -> Result<Vec<i64>> {
        let mut tokens = Vec::with_capacity(events.len());
        for event in events {
            match self.token_to_id.get(event.as_str()) {
                Some(&id) => tokens.push(id),
                None => return Err(anyhow::anyhow!("Unknown event found: {}", event)),
            }
        }
        Ok(tokens)
    }

    pub fn decode(&self, tokens: &[i64]) -> Result<String> {
        let mut events = Vec::with_capacity(tokens.len());
        for &token in tokens {
            match token {
                PAD_TOKEN => {}
                id if id >= 1 && (id as usize) <= self.id_to_token.len() => {
                    events.push(self.id_to_token[id as usize - 1].as_str());
                }
                _ => return Err(anyhow::anyhow!("Invalid token found: {}", token)),
            }
        }
        Ok(events.join(" "))
    }

    /// Distinct events plus one slot for the padding sentinel.
    pub fn vocab_size(&self) -> i64 {
        self.id_to_token.len() as i64 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Vec<String>> {
        vec![
            vec!["C4-1.0", "D4-1.0", "E4-1.0", "C4-1.0"]
                .into_iter()
                .map(String::from)
                .collect(),
            vec!["E4-0.5", "D4-0.5", "C4-1.0"]
                .into_iter()
                .map(String::from)
                .collect(),
        ]
    }

    #[test]
    fn test_tokenizer_round_trip() -> Result<()> {
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&corpus());
        let events: Vec<String> = vec!["C4-1.0", "E4-1.0", "D4-0.5"]
            .into_iter()
            .map(String::from)
            .collect();
        let tokens = tokenizer.encode(&events)?;
        let decoded = tokenizer.decode(&tokens)?;
        assert_eq!(decoded, "C4-1.0 E4-1.0 D4-0.5");
        Ok(())
    }

    #[test]
    fn test_padding_is_skipped_on_decode() -> Result<()> {
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&corpus());
        let events: Vec<String> = vec!["C4-1.0".to_string(), "D4-1.0".to_string()];
        let mut tokens = tokenizer.encode(&events)?;
        tokens.push(PAD_TOKEN);
        tokens.push(PAD_TOKEN);
        let decoded = tokenizer.decode(&tokens)?;
        assert_eq!(decoded, "C4-1.0 D4-1.0");
        Ok(())
    }

    #[test]
    fn test_zero_is_never_assigned() -> Result<()> {
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&corpus());
        for melody in corpus() {
            for token in tokenizer.encode(&melody)? {
                assert!(token >= 1, "Event token should never be 0, got {}", token);
            }
        }
        Ok(())
    }

    #[test]
    fn test_most_frequent_event_gets_lowest_id() -> Result<()> {
        // "C4-1.0" appears three times in the corpus, more than any other event
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&corpus());
        let tokens = tokenizer.encode(&["C4-1.0".to_string()])?;
        assert_eq!(tokens, vec![1]);
        Ok(())
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&corpus());
        let result = tokenizer.encode(&["B9-0.25".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_token_is_an_error() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&corpus());
        assert!(tokenizer.decode(&[9999]).is_err());
        assert!(tokenizer.decode(&[-1]).is_err());
    }

    #[test]
    fn test_vocab_size_counts_padding() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.fit(&corpus());
        // 5 distinct events + 1 padding slot
        assert_eq!(tokenizer.vocab_size(), 6);
    }
}
