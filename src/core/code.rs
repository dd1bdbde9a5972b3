//! Wormhole codes: `<nameplate>-<word>-<word>...`

use super::{Nameplate, wordlist::Wordlist};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CodeFormatError {
    #[error("The code is empty")]
    Empty,
    #[error("The code must start with a number, followed by at least two words, like 7-crossover-clockwork")]
    MissingWords,
    #[error("'{}' is not a valid nameplate, it must be a positive number", _0)]
    InvalidNameplate(String),
    #[error("The code contains an empty word")]
    EmptyWord,
    #[error("'{word}' is not a valid word at position {position} of the code")]
    UnknownWord { position: usize, word: String },
}

/// A wormhole code
///
/// The nameplate is allocated by the mailbox server and locates the mailbox, the words are
/// chosen locally and form the password of the key exchange. The string form is canonical: it is
/// what both sides feed into SPAKE2.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Code {
    nameplate: Nameplate,
    words: Vec<String>,
}

impl Code {
    /// Combine a server-assigned nameplate with freshly chosen random words
    pub fn generate(nameplate: Nameplate, wordlist: &Wordlist) -> Self {
        Code {
            nameplate,
            words: wordlist.choose_words(),
        }
    }

    /// Parse a code typed in by a human
    ///
    /// Surrounding whitespace and case are ignored, every word must come from the list of its position.
    pub fn parse(code: &str, wordlist: &Wordlist) -> Result<Self, CodeFormatError> {
        let code = code.trim().to_lowercase();
        ensure!(!code.is_empty(), CodeFormatError::Empty);

        let mut parts = code.split('-');
        let nameplate = parts.next().unwrap_or_default();
        let nameplate = match nameplate.parse::<u32>() {
            Ok(number) if number > 0 && nameplate.bytes().all(|b| b.is_ascii_digit()) => {
                Nameplate::new(number)
            },
            _ => bail!(CodeFormatError::InvalidNameplate(nameplate.to_string())),
        };

        let words: Vec<String> = parts.map(str::to_string).collect();
        ensure!(words.len() >= 2, CodeFormatError::MissingWords);
        for (position, word) in words.iter().enumerate() {
            ensure!(!word.is_empty(), CodeFormatError::EmptyWord);
            ensure!(
                wordlist.contains(position, word),
                CodeFormatError::UnknownWord {
                    position,
                    word: word.clone(),
                }
            );
        }

        Ok(Code { nameplate, words })
    }

    pub fn nameplate(&self) -> Nameplate {
        self.nameplate
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nameplate)?;
        for word in &self.words {
            write!(f, "-{}", word)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Code {
    type Err = CodeFormatError;

    /// Parse against the default PGP word list
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Code::parse(code, &super::wordlist::default_wordlist(2))
    }
}
