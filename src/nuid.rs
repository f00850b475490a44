//! Unique identifiers for inbox subjects
//!
//! A NUID is 22 base-62 characters: a 12-character random prefix followed by
//! a 10-character sequence. The sequence advances by a random increment, and
//! the prefix is regenerated when it overflows, so ids are unique without
//! coordination and cheap to produce.

use parking_lot::{Mutex, const_mutex};
use rand::Rng;
use rand::rngs::OsRng;

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
/// Total id length
pub const NUID_LEN: usize = PREFIX_LEN + SEQ_LEN;
/// 62^10
const MAX_SEQ: u64 = 839_299_365_868_340_224;
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;

/// NUID generator
#[derive(Debug)]
pub struct Nuid {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}

impl Default for Nuid {
    fn default() -> Self {
        Self::new()
    }
}

impl Nuid {
    #[must_use]
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut nuid = Self {
            prefix: [0; PREFIX_LEN],
            seq: rng.gen_range(0..MAX_SEQ),
            inc: rng.gen_range(MIN_INC..MAX_INC),
        };
        nuid.randomize_prefix();
        nuid
    }

    fn randomize_prefix(&mut self) {
        let mut rng = OsRng;
        for slot in &mut self.prefix {
            *slot = DIGITS[rng.gen_range(0..DIGITS.len())];
        }
    }

    /// Produce the next id
    pub fn next_id(&mut self) -> String {
        self.seq += self.inc;
        if self.seq >= MAX_SEQ {
            self.randomize_prefix();
            let mut rng = rand::thread_rng();
            self.seq = rng.gen_range(0..MAX_SEQ);
            self.inc = rng.gen_range(MIN_INC..MAX_INC);
        }

        let mut out = [0u8; NUID_LEN];
        out[..PREFIX_LEN].copy_from_slice(&self.prefix);
        let mut seq = self.seq;
        for slot in out[PREFIX_LEN..].iter_mut().rev() {
            *slot = DIGITS[(seq % BASE) as usize];
            seq /= BASE;
        }
        // Every byte comes from DIGITS
        String::from_utf8_lossy(&out).into_owned()
    }
}

static GLOBAL: Mutex<Option<Nuid>> = const_mutex(None);

/// Next id from the process-wide generator
pub fn next() -> String {
    GLOBAL.lock().get_or_insert_with(Nuid::new).next_id()
}
