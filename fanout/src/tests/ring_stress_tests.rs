use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::{Consumed, Ring, RingConfig, Sequence};

const ROTATIONS: u64 = 10_000;
const SLOT_SIZE: usize = 64;
const WRITERS: usize = 3;

#[derive(Debug, Default, PartialEq)]
struct Tally {
    publications: u64,
    bytes: u64,
    torn: u64,
    out_of_order: u64,
}

/// Every publication is filled with a single byte value derived from its
/// sequence, so a torn or stale read shows up as a mixed or wrong value.
#[inline]
fn pattern(seq: Sequence) -> u8 {
    (seq.value() % 251) as u8
}

fn consume_all(ring: &Ring, lengths: &[usize]) -> Tally {
    let mut tally = Tally::default();
    let mut seq = Sequence::ZERO;
    loop {
        match ring.consume(seq) {
            Consumed::Chunk(chunk) => {
                let expected = pattern(seq);
                if chunk.sequence() != seq
                    || chunk.len() != lengths[seq.value() as usize]
                {
                    tally.out_of_order += 1;
                }
                if chunk.iter().any(|&b| b != expected) {
                    tally.torn += 1;
                }
                tally.publications += 1;
                tally.bytes += chunk.len() as u64;
            }
            Consumed::Sentinel => return tally,
            Consumed::Poisoned => panic!("ring poisoned at {}", seq),
        }
        seq = seq.next();
    }
}

fn run_rotations(slot_count: usize) {
    let total = ROTATIONS * slot_count as u64;
    let mut rng = StdRng::seed_from_u64(slot_count as u64);
    let lengths: Arc<Vec<usize>> =
        Arc::new((0..total).map(|_| rng.gen_range(1..=SLOT_SIZE)).collect());

    let ring = Arc::new(Ring::new(
        &RingConfig {
            slot_count,
            slot_size: SLOT_SIZE,
        },
        WRITERS,
    ));

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let ring = Arc::clone(&ring);
            let lengths = Arc::clone(&lengths);
            thread::spawn(move || consume_all(&ring, &lengths))
        })
        .collect();

    let mut seq = Sequence::ZERO;
    for &length in lengths.iter() {
        let mut fill = ring.acquire(seq).unwrap();
        fill[..length].fill(pattern(seq));
        ring.publish(fill, length);
        seq = seq.next();
    }
    ring.publish_sentinel(seq);

    let expected = Tally {
        publications: total,
        bytes: lengths.iter().map(|&l| l as u64).sum(),
        torn: 0,
        out_of_order: 0,
    };
    for writer in writers {
        assert_eq!(writer.join().unwrap(), expected);
    }
}

#[test]
fn single_slot_survives_rotations() {
    run_rotations(1);
}

#[test]
fn two_slots_survive_rotations() {
    run_rotations(2);
}

#[test]
fn three_slots_survive_rotations() {
    run_rotations(3);
}
