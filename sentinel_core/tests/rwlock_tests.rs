use rand::Rng;
use sentinel_core::rwlock::{LockMode, RawRwLock, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};

/// Spins until `cond` holds or a second passes.
fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn concurrent_readers() {
    let lock = Arc::new(RawRwLock::new());
    let n_readers = 4;
    let barrier = Arc::new(Barrier::new(n_readers));
    let mut handles = Vec::new();

    for _ in 0..n_readers {
        let l = Arc::clone(&lock);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let _r = l.read_lock();
            // Every reader is inside before any leaves.
            b.wait();
        }));
    }
    for h in handles {
        h.join().expect("reader thread panicked");
    }
    assert_eq!(lock.mode(), LockMode::Unlocked);
}

#[test]
fn writer_excludes_readers() {
    let lock = Arc::new(RawRwLock::new());
    let (ready_tx, ready_rx) = mpsc::channel();

    let l = Arc::clone(&lock);
    let writer = thread::spawn(move || {
        let _w = l.write_lock();
        ready_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
    });

    ready_rx.recv().unwrap();
    let start = Instant::now();
    {
        let _r = lock.read_lock();
    }
    assert!(start.elapsed() >= Duration::from_millis(45));
    writer.join().unwrap();
}

#[test]
fn readers_block_writer() {
    let lock = Arc::new(RawRwLock::new());
    let n_readers = 3;
    let barrier = Arc::new(Barrier::new(n_readers + 1));
    let mut handles = Vec::new();

    for _ in 0..n_readers {
        let l = Arc::clone(&lock);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let r = l.read_lock();
            b.wait();
            thread::sleep(Duration::from_millis(50));
            drop(r);
        }));
    }

    barrier.wait();
    let start = Instant::now();
    let _w = lock.write_lock();
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(45),
        "writer did not wait for readers: waited only {:?}",
        elapsed
    );
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn queued_writer_blocks_new_readers() {
    let lock = Arc::new(RawRwLock::new());
    let first = lock.read_lock();

    let l = Arc::clone(&lock);
    let writer = thread::spawn(move || {
        let _w = l.write_lock();
    });
    wait_for(|| lock.waiters().1 == 1);

    let l = Arc::clone(&lock);
    let late_reader = thread::spawn(move || l.try_read_for(Duration::from_millis(30)).is_some());
    assert!(!late_reader.join().unwrap(), "reader overtook a queued writer");

    drop(first);
    writer.join().unwrap();
    assert!(lock.try_read_for(Duration::from_millis(30)).is_some());
}

#[test]
fn promotion_waits_for_other_readers() {
    let lock = Arc::new(RwLock::new(0u32));
    let other = Arc::new(Barrier::new(2));

    let l = Arc::clone(&lock);
    let b = Arc::clone(&other);
    let reader = thread::spawn(move || {
        let r = l.read();
        b.wait();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(*r, 0);
    });

    let mine = lock.read();
    other.wait();
    let start = Instant::now();
    let mut w = mine.promote();
    assert!(start.elapsed() >= Duration::from_millis(30));
    *w += 1;
    drop(w);
    reader.join().unwrap();
    assert_eq!(*lock.read(), 1);
}

#[test]
fn concurrent_promoters_are_serialized() {
    let lock = Arc::new(RwLock::new(Vec::<usize>::new()));
    let inside = Arc::new(AtomicBool::new(false));
    let n = 4;
    let barrier = Arc::new(Barrier::new(n));
    let mut handles = Vec::new();

    for i in 0..n {
        let l = Arc::clone(&lock);
        let b = Arc::clone(&barrier);
        let inside = Arc::clone(&inside);
        handles.push(thread::spawn(move || {
            let r = l.read();
            b.wait();
            let mut w = r.promote();
            assert!(!inside.swap(true, Ordering::SeqCst), "two promoters inside at once");
            w.push(i);
            thread::sleep(Duration::from_millis(5));
            inside.store(false, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.join().expect("promoter deadlocked or panicked");
    }
    let mut seen = lock.read().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..n).collect::<Vec<_>>());
}

#[test]
fn try_write_zero_timeout_with_reader_present() {
    let lock = RawRwLock::new();
    let w = lock.try_write_for(Duration::ZERO);
    assert!(w.is_some());
    assert!(lock.try_write_for(Duration::ZERO).is_none());
    drop(w);

    let r = lock.read_lock();
    let start = Instant::now();
    assert!(lock.try_write_for(Duration::ZERO).is_none());
    assert!(start.elapsed() < Duration::from_millis(20));
    drop(r);
    assert!(lock.try_write_for(Duration::ZERO).is_some());
}

#[test]
fn try_read_times_out_under_writer() {
    let lock = Arc::new(RawRwLock::new());
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let l = Arc::clone(&lock);
    let writer = thread::spawn(move || {
        let _w = l.write_lock();
        ready_tx.send(()).unwrap();
        done_rx.recv().unwrap();
    });
    ready_rx.recv().unwrap();

    let start = Instant::now();
    assert!(lock.try_read_for(Duration::from_millis(20)).is_none());
    assert!(start.elapsed() >= Duration::from_millis(15));
    assert_eq!(lock.waiters(), (0, 0, 0));

    done_tx.send(()).unwrap();
    writer.join().unwrap();
    assert!(lock.try_read_for(Duration::from_millis(50)).is_some());
}

#[test]
fn abandoned_writer_releases_queued_readers() {
    let lock = Arc::new(RawRwLock::new());
    let held = lock.read_lock();

    // A writer that will give up, and a reader queued behind it.
    let l = Arc::clone(&lock);
    let writer = thread::spawn(move || l.try_write_for(Duration::from_millis(40)).is_some());
    wait_for(|| lock.waiters().1 == 1);
    let l = Arc::clone(&lock);
    let reader = thread::spawn(move || {
        let _r = l.read_lock();
    });

    assert!(!writer.join().unwrap());
    reader.join().unwrap();
    drop(held);
    assert_eq!(lock.mode(), LockMode::Unlocked);
}

/// Random mix of reads, writes and promotions; a pair of counters is only
/// ever updated together, so any torn read means exclusion failed.
#[test]
fn random_stress_keeps_pairs_consistent() {
    let threads = num_cpus::get().clamp(2, 8);
    let lock = Arc::new(RwLock::new((0u64, 0u64)));
    let writes = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..threads {
        let l = Arc::clone(&lock);
        let writes = Arc::clone(&writes);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for _ in 0..500 {
                match rng.random_range(0..4u8) {
                    0 => {
                        let r = l.read();
                        assert_eq!(r.0, r.1);
                    }
                    1 => {
                        let mut w = l.write();
                        w.0 += 1;
                        w.1 += 1;
                        writes.fetch_add(1, Ordering::Relaxed);
                    }
                    2 => {
                        let r = l.read();
                        assert_eq!(r.0, r.1);
                        let mut w = r.promote();
                        w.0 += 1;
                        w.1 += 1;
                        writes.fetch_add(1, Ordering::Relaxed);
                        let r = w.downgrade();
                        assert_eq!(r.0, r.1);
                    }
                    _ => {
                        if let Some(mut w) = l.try_write_for(Duration::from_micros(200)) {
                            w.0 += 1;
                            w.1 += 1;
                            writes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().expect("stress thread panicked");
    }
    let r = lock.read();
    assert_eq!(r.0, r.1);
    assert_eq!(r.0 as usize, writes.load(Ordering::Relaxed));
    assert_eq!(lock.raw().waiters(), (0, 0, 0));
}
