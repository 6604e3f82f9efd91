//! Chronologically ordered 20-character identifiers for pushed children.

use rand::Rng;

/// The encoding alphabet, chosen so that the ASCII order of the characters
/// matches the numeric order of the values they encode.
const PUSH_CHARS: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Generates push ids whose lexicographic order matches generation order:
/// eight characters of millisecond timestamp followed by twelve random
/// characters, incremented as a counter within one millisecond.
#[derive(Debug)]
pub struct PushIdGenerator<R> {
    rng: R,
    last_time: i64,
    last_rand: [u8; 12],
}

impl<R: Rng> PushIdGenerator<R> {
    /// Creates a generator drawing randomness from `rng`.
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            last_time: i64::MIN,
            last_rand: [0; 12],
        }
    }

    /// Produces the next id for the given server-synchronized time in
    /// milliseconds.
    pub fn next_id(&mut self, now_ms: i64) -> String {
        if now_ms == self.last_time {
            // Same millisecond: increment the tail, carrying leftwards.
            for slot in self.last_rand.iter_mut().rev() {
                if *slot == 63 {
                    *slot = 0;
                } else {
                    *slot += 1;
                    break;
                }
            }
        } else {
            for slot in self.last_rand.iter_mut() {
                *slot = self.rng.gen_range(0..64);
            }
        }
        self.last_time = now_ms;

        let mut id = [0u8; 20];
        let mut time = now_ms;
        for slot in id[..8].iter_mut().rev() {
            *slot = PUSH_CHARS[(time % 64) as usize];
            time /= 64;
        }
        for (slot, rand) in id[8..].iter_mut().zip(self.last_rand.iter()) {
            *slot = PUSH_CHARS[*rand as usize];
        }
        String::from_utf8(id.to_vec()).expect("alphabet is ascii")
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn generator() -> PushIdGenerator<ChaCha8Rng> {
        PushIdGenerator::new(ChaCha8Rng::seed_from_u64(7))
    }

    #[test]
    fn ids_are_time_ordered() {
        let mut gen = generator();
        let a = gen.next_id(1_000);
        let b = gen.next_id(2_000);
        let c = gen.next_id(2_001);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn same_millisecond_increments_tail() {
        let mut gen = generator();
        let a = gen.next_id(5_000);
        let b = gen.next_id(5_000);
        assert!(a < b);
        assert_eq!(a[..8], b[..8]);
        // The tails differ exactly by one increment of the final character
        // unless a carry rippled through.
        let a_tail: Vec<usize> = a[8..]
            .bytes()
            .map(|c| PUSH_CHARS.iter().position(|p| *p == c).unwrap())
            .collect();
        let b_tail: Vec<usize> = b[8..]
            .bytes()
            .map(|c| PUSH_CHARS.iter().position(|p| *p == c).unwrap())
            .collect();
        let a_num = a_tail.iter().fold(0u128, |acc, d| acc * 64 + *d as u128);
        let b_num = b_tail.iter().fold(0u128, |acc, d| acc * 64 + *d as u128);
        assert_eq!(b_num, a_num + 1);
    }

    #[test]
    fn counter_carry_overflows_toward_front() {
        let mut gen = generator();
        gen.next_id(9_000);
        gen.last_rand = [0, 0, 0, 0, 0, 0, 0, 0, 0, 63, 63, 63];
        let id = gen.next_id(9_000);
        let tail: Vec<usize> = id[8..]
            .bytes()
            .map(|c| PUSH_CHARS.iter().position(|p| *p == c).unwrap())
            .collect();
        assert_eq!(tail, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn alphabet_is_ascii_sorted() {
        for pair in PUSH_CHARS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
