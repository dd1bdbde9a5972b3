//! Wordlist generation and wormhole code completion
use rand::{rngs::OsRng, seq::SliceRandom};
use std::{collections::BTreeMap, fmt, sync::OnceLock};

/// The words that make up the secret part of a wormhole code
///
/// Words alternate between two lists (three syllables, then two), so that a swapped or dropped
/// word gets noticed when parsing.
#[derive(PartialEq)]
pub struct Wordlist {
    /// Number of words in a generated wormhole code
    num_words: usize,
    /// Odd and even wordlist
    words: Vec<Vec<String>>,
}

impl fmt::Debug for Wordlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wordlist ( {}, lots of words...)", self.num_words)
    }
}

impl Wordlist {
    #[cfg(test)]
    #[doc(hidden)]
    pub fn new(num_words: usize, words: Vec<Vec<String>>) -> Wordlist {
        Wordlist { num_words, words }
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    /// The same words, but generating codes of a different length
    pub fn with_num_words(&self, num_words: usize) -> Wordlist {
        Wordlist {
            num_words,
            words: self.words.clone(),
        }
    }

    /// Completes a partially typed wormhole code like `7-cros`
    ///
    /// Only the last word is completed, against the list of its position. A prefix without
    /// any dash is still the nameplate and has no completions.
    pub fn get_completions(&self, prefix: &str) -> Vec<String> {
        let Some((prefix_without_last, last_partial)) = prefix.rsplit_once('-') else {
            return Vec::new();
        };
        let position = prefix.matches('-').count() - 1;

        self.normal_complete(&last_partial.to_lowercase(), self.words_at(position))
            .into_iter()
            .map(|word| format!("{}-{}", prefix_without_last, word))
            .collect()
    }

    fn normal_complete(&self, partial: &str, words: &[String]) -> Vec<String> {
        words
            .iter()
            .filter(|word| word.starts_with(partial))
            .cloned()
            .collect()
    }

    /// The list the word at `position` (counting from zero, after the nameplate) is drawn from
    fn words_at(&self, position: usize) -> &[String] {
        &self.words[position % self.words.len()]
    }

    /// Whether `word` may appear at `position` of a code
    pub fn contains(&self, position: usize, word: &str) -> bool {
        self.words_at(position).iter().any(|w| w == word)
    }

    /// Choose wormhole code words using the operating system's random number generator
    pub fn choose_words(&self) -> Vec<String> {
        let mut rng = OsRng;
        self.words
            .iter()
            .cycle()
            .take(self.num_words)
            .filter_map(|words| words.choose(&mut rng).cloned())
            .collect()
    }
}

fn load_pgpwords() -> Vec<Vec<String>> {
    let raw_words: BTreeMap<String, (String, String)> =
        serde_json::from_str(include_str!("pgpwords.json"))
            .expect("The bundled word list is valid JSON");
    let mut even_words: Vec<String> = Vec::with_capacity(256);
    let mut odd_words: Vec<String> = Vec::with_capacity(256);
    /* Keys are zero-padded hex, so the BTreeMap iterates them in byte order */
    for (two_syllables, three_syllables) in raw_words.into_values() {
        even_words.push(three_syllables.to_lowercase());
        odd_words.push(two_syllables.to_lowercase());
    }

    vec![even_words, odd_words]
}

/// Construct Wordlist struct with given number of words in a wormhole code
pub fn default_wordlist(num_words: usize) -> Wordlist {
    static WORDS: OnceLock<Vec<Vec<String>>> = OnceLock::new();
    Wordlist {
        num_words,
        words: WORDS.get_or_init(load_pgpwords).clone(),
    }
}
