use lfhash::{Error, LfHash, LfHashBuilder};

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
};

const CHECK: u32 = 0xdead_beef;

/// A 4-byte key followed by the key xor `CHECK`.
fn element(key: u32) -> [u8; 8] {
    let mut element = [0; 8];
    element[..4].copy_from_slice(&key.to_le_bytes());
    element[4..].copy_from_slice(&(key ^ CHECK).to_le_bytes());
    element
}

fn assert_intact(found: &[u8]) {
    let key = u32::from_le_bytes(found[..4].try_into().unwrap());
    let check = u32::from_le_bytes(found[4..].try_into().unwrap());
    assert_eq!(key ^ CHECK, check, "element {key} was overwritten");
}

struct XorShift(u64);

impl XorShift {
    fn seeded() -> Self {
        let mut seed = [0; 8];
        getrandom::getrandom(&mut seed).expect("no entropy source");
        Self(u64::from_le_bytes(seed) | 1)
    }

    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn no_lost_inserts_or_deletes() {
    const NUM_THREADS: u32 = 8;
    const KEYS_PER_THREAD: u32 = 2_000;

    let table = Arc::new(LfHash::new(8, 0, 4).unwrap());
    let barrier = Arc::new(Barrier::new(NUM_THREADS as usize));

    let spawn = |delete: bool| -> Vec<_> {
        (0..NUM_THREADS)
            .map(|i| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    let mut pins = table.pins().unwrap();
                    barrier.wait();

                    for key in i * KEYS_PER_THREAD..(i + 1) * KEYS_PER_THREAD {
                        if delete {
                            table.delete(&mut pins, &key.to_le_bytes()).unwrap();
                        } else {
                            table.insert(&mut pins, &element(key)).unwrap();
                        }
                    }
                })
            })
            .collect()
    };

    for t in spawn(false) {
        t.join().expect("inserting thread panicked");
    }

    let total = NUM_THREADS * KEYS_PER_THREAD;
    assert_eq!(table.len(), total as usize);
    assert!(table.bucket_count() >= total / 2);
    {
        let mut pins = table.pins().unwrap();
        for key in 0..total {
            let found = table.search(&mut pins, &key.to_le_bytes()).unwrap();
            assert_eq!(&*found, &element(key));
        }
    }

    for t in spawn(true) {
        t.join().expect("deleting thread panicked");
    }

    assert!(table.is_empty());
    let mut pins = table.pins().unwrap();
    for key in 0..total {
        assert!(!table.contains(&mut pins, &key.to_le_bytes()));
    }
}

#[test]
fn one_of_two_equal_inserts_wins() {
    const ROUNDS: u32 = 200;
    const NUM_THREADS: usize = 2;

    let table = Arc::new(LfHash::new(8, 0, 4).unwrap());

    for round in 0..ROUNDS {
        let barrier = Arc::new(Barrier::new(NUM_THREADS));
        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    let mut pins = table.pins().unwrap();
                    barrier.wait();
                    table.insert(&mut pins, &element(round))
                })
            })
            .collect();

        let mut results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        results.sort_by_key(|r| r.is_err());
        assert_eq!(results, vec![Ok(()), Err(Error::DuplicateKey)]);
    }

    assert_eq!(table.len(), ROUNDS as usize);
}

#[test]
fn one_of_two_equal_deletes_wins() {
    const ROUNDS: u32 = 200;
    const NUM_THREADS: usize = 2;

    let table = Arc::new(LfHash::new(8, 0, 4).unwrap());
    {
        let mut pins = table.pins().unwrap();
        for key in 0..ROUNDS {
            table.insert(&mut pins, &element(key)).unwrap();
        }
    }

    for round in 0..ROUNDS {
        let barrier = Arc::new(Barrier::new(NUM_THREADS));
        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    let mut pins = table.pins().unwrap();
                    barrier.wait();
                    table.delete(&mut pins, &round.to_le_bytes())
                })
            })
            .collect();

        let mut results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        results.sort_by_key(|r| r.is_err());
        assert_eq!(results, vec![Ok(()), Err(Error::NotFound)]);
    }

    assert!(table.is_empty());
}

// Many threads hammer a handful of keys in a table that starts with few
// buckets, so nodes are unlinked, retired and reused all the time. Every
// element that a search returns must still hold what was written for its key.
//
// Each thread also owns a private range of keys that nobody else touches; the
// outcome of every operation on those is known in advance.
#[test]
fn small_table_stress() {
    const NUM_THREADS: usize = 8;
    const SHARED_KEYS: u64 = 100;
    const OWN_KEYS: u32 = 16;
    const OPS: usize = 50_000;

    let table = Arc::new(
        LfHashBuilder::new(8)
            .key(0, 4)
            .initial_buckets(8)
            .build()
            .unwrap(),
    );
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let hits = Arc::new(AtomicUsize::default());

    let threads: Vec<_> = (0..NUM_THREADS)
        .map(|i| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let hits = Arc::clone(&hits);

            thread::spawn(move || {
                let mut rng = XorShift::seeded();
                let own_base = 1_000 + i as u32 * OWN_KEYS;
                let mut own_present = [false; OWN_KEYS as usize];
                let mut pins = table.pins().unwrap();
                barrier.wait();

                for _ in 0..OPS {
                    let r = rng.next();
                    let key = (r % SHARED_KEYS) as u32;
                    match (r >> 32) % 4 {
                        0 => match table.insert(&mut pins, &element(key)) {
                            Ok(()) | Err(Error::DuplicateKey) => {}
                            Err(e) => panic!("insert failed: {e}"),
                        },
                        1 => match table.delete(&mut pins, &key.to_le_bytes()) {
                            Ok(()) | Err(Error::NotFound) => {}
                            Err(e) => panic!("delete failed: {e}"),
                        },
                        2 => {
                            if let Some(found) = table.search(&mut pins, &key.to_le_bytes()) {
                                assert_eq!(&found[..4], &key.to_le_bytes());
                                assert_intact(&found);
                                hits.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ => {
                            let slot = ((r >> 40) % u64::from(OWN_KEYS)) as usize;
                            let own = own_base + slot as u32;
                            if own_present[slot] {
                                assert_eq!(table.delete(&mut pins, &own.to_le_bytes()), Ok(()));
                            } else {
                                assert_eq!(table.insert(&mut pins, &element(own)), Ok(()));
                            }
                            own_present[slot] = !own_present[slot];
                            assert_eq!(
                                table.contains(&mut pins, &own.to_le_bytes()),
                                own_present[slot]
                            );
                        }
                    }
                }
                own_present.iter().filter(|&&p| p).count()
            })
        })
        .collect();

    let own_total: usize = threads
        .into_iter()
        .map(|t| t.join().expect("worker panicked"))
        .sum();

    let mut pins = table.pins().unwrap();
    let shared_total = (0..SHARED_KEYS as u32)
        .filter(|key| table.contains(&mut pins, &key.to_le_bytes()))
        .count();
    assert_eq!(table.len(), shared_total + own_total);
    assert!(hits.load(Ordering::Relaxed) > 0);
}

#[test]
fn readers_and_writers_on_one_key() {
    const READERS: usize = 4;
    const WRITES: u32 = 20_000;

    let table = Arc::new(LfHash::new(8, 0, 4).unwrap());
    let barrier = Arc::new(Barrier::new(READERS + 1));
    let done = Arc::new(AtomicUsize::default());

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);

            thread::spawn(move || {
                let mut pins = table.pins().unwrap();
                barrier.wait();
                while done.load(Ordering::Acquire) == 0 {
                    if let Some(found) = table.search(&mut pins, &7u32.to_le_bytes()) {
                        let version = found[4..].to_vec();
                        // Hold the pin for a moment while the writer churns. A
                        // pinned element must not be reused for a later insert.
                        thread::yield_now();
                        assert_eq!(&found[..4], &7u32.to_le_bytes());
                        assert_eq!(&found[4..], &version[..]);
                    }
                }
            })
        })
        .collect();

    {
        let mut pins = table.pins().unwrap();
        barrier.wait();
        for version in 0..WRITES {
            let mut element = [0; 8];
            element[..4].copy_from_slice(&7u32.to_le_bytes());
            element[4..].copy_from_slice(&version.to_le_bytes());
            table.insert(&mut pins, &element).unwrap();
            table.delete(&mut pins, &7u32.to_le_bytes()).unwrap();
        }
        done.store(1, Ordering::Release);
    }

    for t in readers {
        t.join().expect("reader panicked");
    }
    assert!(table.is_empty());
}
