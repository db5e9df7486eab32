//! Correlation-id generator.
//!
//! Each thread keeps a fixed-width decimal counter seeded from a random source.
//! Ids advance by one per call; when every digit is `9` the counter is re-seeded.

use rand::Rng;
use std::cell::RefCell;

pub const MSG_ID_LENGTH: usize = 20;

thread_local! {
    static MSG_ID_NO: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Return a fresh correlation id for the calling thread.
pub fn next_msg_id() -> String {
    MSG_ID_NO.with(|cell| {
        let mut no = cell.borrow_mut();
        if no.is_empty() || no.iter().all(|d| *d == b'9') {
            *no = random_digits(MSG_ID_LENGTH);
        } else {
            increment(&mut no);
        }
        String::from_utf8_lossy(&no).into_owned()
    })
}

fn random_digits(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| b'0' + rng.gen_range(0..10u8)).collect()
}

/// Decimal increment. Caller guarantees not all digits are `9`.
fn increment(digits: &mut [u8]) {
    for d in digits.iter_mut().rev() {
        if *d == b'9' {
            *d = b'0';
        } else {
            *d += 1;
            return;
        }
    }
}
