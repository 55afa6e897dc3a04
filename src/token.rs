use rand::Rng;

/// Number of characters in a token. 26^32 possible values.
pub const TOKEN_LENGTH: usize = 32;

/// Something that can hand out workspace tokens. A token names the
/// workspace, every file in it and the sandbox instance.
pub trait TokenSource: Send + Sync {
    fn generate(&self) -> String;
}

/// Tokens drawn from the thread local generator of `rand`, which is a
/// cryptographically secure generator seeded from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokens;

impl TokenSource for RandomTokens {
    fn generate(&self) -> String {
        let mut rng = rand::rng();
        (0..TOKEN_LENGTH)
            .map(|_| char::from(rng.random_range(b'a'..=b'z')))
            .collect()
    }
}

/// Returns a fresh token from the default source.
pub fn random_token() -> String {
    RandomTokens.generate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_token_shape() {
        let t = random_token();
        assert_that!(t.len()).is_equal_to(TOKEN_LENGTH);
        assert_that!(t.chars().all(|c| c.is_ascii_lowercase())).is_true();
    }

    #[test]
    fn test_tokens_do_not_collide() {
        let tokens: BTreeSet<String> = (0..10_000).map(|_| random_token()).collect();
        assert_that!(tokens.len()).is_equal_to(10_000);
    }

    #[test]
    fn test_tokens_do_not_collide_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| random_token()).collect::<Vec<_>>()))
            .collect();
        let mut all: BTreeSet<String> = BTreeSet::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_that!(all.len()).is_equal_to(8000);
    }
}
