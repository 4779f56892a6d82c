use core::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{PEER_ID_CHARSET, PEER_ID_LEN};
use crate::error::PeerIdError;

/// Short, human-typeable identifier registered with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Draw a fresh identifier. Uniqueness is left to the broker.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let id = (0..PEER_ID_LEN)
            .map(|_| PEER_ID_CHARSET[rng.random_range(0..PEER_ID_CHARSET.len())] as char)
            .collect();
        PeerId(id)
    }

    /// Generate with the thread-local RNG.
    pub fn random() -> Self {
        Self::generate(&mut rand::rng())
    }

    /// Validate user input. Surrounding whitespace is ignored and lowercase accepted.
    pub fn parse(input: &str) -> Result<Self, PeerIdError> {
        let id = input.trim().to_ascii_uppercase();
        let len = id.chars().count();
        if len != PEER_ID_LEN {
            return Err(PeerIdError::WrongLength {
                expected: PEER_ID_LEN,
                actual: len,
            });
        }
        if let Some(bad) = id.chars().find(|c| !c.is_ascii() || !PEER_ID_CHARSET.contains(&(*c as u8))) {
            return Err(PeerIdError::InvalidSymbol(bad));
        }
        Ok(PeerId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerId::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn generated_ids_are_valid() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..200 {
            let id = PeerId::generate(&mut rng);
            assert_eq!(PeerId::parse(id.as_str()), Ok(id));
        }
    }

    #[test]
    fn parse_normalizes_input() {
        assert_eq!(PeerId::parse("  ab12cd ").unwrap().as_str(), "AB12CD");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(
            PeerId::parse("ABC"),
            Err(PeerIdError::WrongLength { expected: 6, actual: 3 })
        );
        assert_eq!(PeerId::parse("AB-12C"), Err(PeerIdError::InvalidSymbol('-')));
        assert!(PeerId::parse("ÄB12CD").is_err());
    }
}
