use std::collections::HashSet;
use std::ops::Range;
use std::process;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_utils::thread;
use log::{error, info};
use rand::prelude::*;

use bst_bench::{CoarseGrainedTree, ConcurrentSet, FineGrainedTree, LockFreeTree};

/// Correctness self-test and load-test driver for the three trees.
#[derive(Parser)]
#[command(name = "bst-bench")]
struct Args {
    /// Tree implementation: 0=coarse-grained, 1=fine-grained, 2=lock-free
    #[arg(short = 'a', long = "algorithm", default_value_t = 0)]
    algorithm: usize,

    /// Run the correctness self-test
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Load-test pattern: 0=insert, 1=erase, 2=find, 3=contention,
    /// 4=write-heavy, 5=mixed, 6=read-heavy
    #[arg(short = 'p', long = "pattern")]
    pattern: Option<usize>,

    /// Worker thread count
    #[arg(short = 'n', long = "threads", default_value_t = 2)]
    threads: usize,

    /// Workload size
    #[arg(short = 'd', long = "data-size", default_value_t = 10_000)]
    data_size: usize,
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();
    match args.algorithm {
        0 => run::<CoarseGrainedTree<i32>>(&args),
        1 => run::<FineGrainedTree<i32>>(&args),
        2 => run::<LockFreeTree<i32>>(&args),
        other => {
            error!("unknown algorithm {other}; expected 0=coarse-grained, 1=fine-grained, 2=lock-free");
            process::exit(2);
        }
    }
}

fn run<S: ConcurrentSet<i32>>(args: &Args) {
    if args.test {
        self_test::<S>(args);
    } else if let Some(pattern) = args.pattern {
        load_test::<S>(pattern, args);
    } else {
        error!("nothing to do; pass -t for the self-test or -p <0..6> for a load test");
        process::exit(2);
    }
}

/// Splits `0..total` into even slices, one per part.
fn chunk(total: usize, parts: usize, idx: usize) -> Range<usize> {
    let per = (total + parts - 1) / parts;
    let start = (idx * per).min(total);
    let end = ((idx + 1) * per).min(total);
    start..end
}

/// Spawns the workers and measures spawn-to-join of the whole phase.
fn timed<S: ConcurrentSet<i32>>(
    set: &S,
    threads: usize,
    work: impl Fn(usize, &S) + Sync,
) -> Duration {
    let start = Instant::now();
    thread::scope(|s| {
        for tid in 0..threads {
            let work = &work;
            s.spawn(move |_| {
                set.register_thread(tid);
                work(tid, set);
            });
        }
    })
    .unwrap();
    start.elapsed()
}

fn self_test<S: ConcurrentSet<i32>>(args: &Args) {
    info!(
        "self-test with n={} d={}",
        args.threads, args.data_size
    );
    let start = Instant::now();
    single_thread_test::<S>(args.data_size);
    multi_thread_test::<S>(args.threads, args.data_size);
    info!("self-test finished in {:.3}s", start.elapsed().as_secs_f64());
    println!("self-test passed");
}

fn single_thread_test<S: ConcurrentSet<i32>>(size: usize) {
    const KEY_RANGE: i32 = 1_000;

    let set = S::new();
    set.set_thread_count(1);
    set.register_thread(0);
    let mut rng = rand::thread_rng();
    let keys: Vec<i32> = (0..size).map(|_| rng.gen_range(0..KEY_RANGE)).collect();
    let unique: HashSet<i32> = keys.iter().copied().collect();

    for &key in &keys {
        set.insert(key);
    }
    assert_eq!(set.len(), unique.len());
    for &key in &keys {
        assert!(set.find(&key));
    }
    assert!(!set.find(&i32::MIN));
    assert!(!set.find(&i32::MAX));
    for &key in &keys {
        set.erase(&key);
        assert!(!set.find(&key));
    }
    assert_eq!(set.len(), 0);
    info!("single-thread correctness passed");
}

fn multi_thread_test<S: ConcurrentSet<i32>>(threads: usize, size: usize) {
    let set = S::new();
    set.set_thread_count(threads);
    timed(&set, threads, |tid, set| {
        let keys: Vec<i32> = chunk(size, threads, tid).map(|k| k as i32).collect();
        for &key in &keys {
            set.insert(key);
        }
        for &key in &keys {
            assert!(set.find(&key));
        }
        for &key in &keys {
            set.erase(&key);
        }
        for &key in &keys {
            assert!(!set.find(&key));
        }
    });
    assert_eq!(set.len(), 0);
    info!("multi-thread correctness passed");
}

fn load_test<S: ConcurrentSet<i32>>(pattern: usize, args: &Args) {
    let threads = args.threads;
    let size = args.data_size;
    let set = S::new();
    set.set_thread_count(threads);

    let insert_slice = |tid: usize, set: &S| {
        for key in chunk(size, threads, tid) {
            set.insert(key as i32);
        }
    };

    let elapsed = match pattern {
        // Insert only.
        0 => timed(&set, threads, insert_slice),
        // Pre-fill, then time the erases.
        1 => {
            timed(&set, threads, insert_slice);
            timed(&set, threads, |tid, set: &S| {
                for key in chunk(size, threads, tid) {
                    set.erase(&(key as i32));
                }
            })
        }
        // Pre-fill, then time the finds.
        2 => {
            timed(&set, threads, insert_slice);
            timed(&set, threads, |tid, set: &S| {
                for key in chunk(size, threads, tid) {
                    set.find(&(key as i32));
                }
            })
        }
        // Inserters, erasers, and finders race over the same data.
        3 => {
            if threads < 3 {
                error!("the contention pattern needs at least 3 threads");
                process::exit(2);
            }
            let third = threads / 3;
            timed(&set, threads, |tid, set: &S| {
                if tid < third {
                    for key in chunk(size, third, tid) {
                        set.insert(key as i32);
                    }
                } else if tid < 2 * third {
                    for key in chunk(size, third, tid - third) {
                        set.erase(&(key as i32));
                    }
                } else {
                    let finders = threads - 2 * third;
                    for key in chunk(size, finders, tid - 2 * third) {
                        set.find(&(key as i32));
                    }
                }
            })
        }
        // Write-heavy: 50% insert, 50% erase.
        4 => timed(&set, threads, |tid, set: &S| {
            for key in chunk(size, threads, tid) {
                set.insert(key as i32);
            }
            for key in chunk(size, threads, tid) {
                set.erase(&(key as i32));
            }
        }),
        // Mixed: 20% insert, 20% erase, 60% find.
        5 => timed(&set, threads, |tid, set: &S| {
            for key in chunk(size, threads, tid) {
                set.insert(key as i32);
            }
            for _ in 0..3 {
                for key in chunk(size, threads, tid) {
                    set.find(&(key as i32));
                }
            }
            for key in chunk(size, threads, tid) {
                set.erase(&(key as i32));
            }
        }),
        // Read-heavy: 10% insert, 90% find.
        6 => timed(&set, threads, |tid, set: &S| {
            for key in chunk(size, threads, tid) {
                set.insert(key as i32);
            }
            for _ in 0..9 {
                for key in chunk(size, threads, tid) {
                    set.find(&(key as i32));
                }
            }
        }),
        other => {
            error!(
                "unknown pattern {other}; expected 0=insert, 1=erase, 2=find, 3=contention, \
                 4=write-heavy, 5=mixed, 6=read-heavy"
            );
            process::exit(2);
        }
    };

    println!("{:.6}", elapsed.as_secs_f64());
}
