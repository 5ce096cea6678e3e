//! Multithreaded stress: concurrent readers and writers swapping managed
//! objects through atomic slots, with leak-freedom checked at the end.

mod common;

use common::{Tracked, make, serial, xrand};
use phaseref::{Counted, Refcounted, acquire, finalize, flush, read_enter, read_exit, release};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

type Slots = Arc<Vec<AtomicPtr<Counted<Tracked>>>>;

#[test]
fn concurrent_slot_swap_is_leak_free() {
    let _serial = serial();

    const THREADS: usize = 16;
    const LOOPS: usize = 1000;

    let live = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(AtomicPtr::new(make(&live, 0x9e37)));
    let writer_lock = Arc::new(Mutex::new(()));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let live = live.clone();
        let slot = slot.clone();
        let writer_lock = writer_lock.clone();
        handles.push(thread::spawn(move || {
            let mut rng = 0x1234_5678 ^ (t as u32).wrapping_mul(7919);
            let mut swaps = 0usize;
            let mut reads = 0usize;
            let mut collisions = 0usize;

            for _ in 0..LOOPS {
                read_enter();
                let p = slot.load(Ordering::Acquire);
                // SAFETY: p came from the live slot inside this section.
                let value = unsafe { (*p).value().value };

                if xrand(&mut rng) % 4 == 0 {
                    let fresh = make(&live, value.wrapping_mul(2));
                    let guard = writer_lock.lock().unwrap_or_else(|e| e.into_inner());
                    if slot
                        .compare_exchange(p, fresh, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        // SAFETY: p is the displaced object; the slot's
                        // reference is dropped here.
                        unsafe { release(p) };
                        swaps += 1;
                    } else {
                        // Lost the race; the object was never published.
                        // SAFETY: fresh is exclusively ours.
                        unsafe { finalize((*fresh).header().as_ptr()) };
                        collisions += 1;
                    }
                    drop(guard);
                } else {
                    reads += 1;
                }
                read_exit();
            }
            (swaps, reads, collisions)
        }));
    }

    let mut accounted = 0usize;
    for handle in handles {
        let (swaps, reads, collisions) = handle.join().expect("worker");
        accounted += swaps + reads + collisions;
    }
    assert_eq!(accounted, THREADS * LOOPS, "every iteration accounted for");

    // Drop the final slot reference and reclaim everything.
    let last = slot.load(Ordering::Acquire);
    read_enter();
    // SAFETY: last is the published object; this drops the slot's
    // reference.
    unsafe { release(last) };
    read_exit();
    flush().expect("outside any read section");
    assert_eq!(live.load(Ordering::SeqCst), 0, "no object may leak");
}

#[test]
fn array_swap_stress_reclaims_everything() {
    let _serial = serial();

    const N_ELEM: usize = 16;
    const LOOPS: usize = 100;
    const GROUPS: usize = 5;

    let live = Arc::new(AtomicUsize::new(0));
    let mut seed = 0x8badf00d_u32;

    let build = |live: &Arc<AtomicUsize>, seed: &mut u32| -> Slots {
        Arc::new(
            (0..N_ELEM)
                .map(|_| AtomicPtr::new(make(live, xrand(seed))))
                .collect(),
        )
    };
    let array_1 = build(&live, &mut seed);
    let array_2 = build(&live, &mut seed);

    let reader = |mut rng: u32, a1: Slots, a2: Slots| {
        move || {
            for i in 0..LOOPS {
                let base = if i & 1 == 1 { &a1 } else { &a2 };
                read_enter();
                let p = base[xrand(&mut rng) as usize % N_ELEM].load(Ordering::Acquire);
                // SAFETY: p came from a live slot inside this section.
                let _value = unsafe { (*p).value().value };
                read_exit();
            }
        }
    };

    let swapper = |mut rng: u32, a1: Slots, a2: Slots| {
        move || {
            for _ in 0..LOOPS {
                read_enter();
                // SAFETY: the first array's slots stay populated, so the
                // loaded pointer is live; the acquire becomes the second
                // slot's reference once published.
                unsafe {
                    let p = acquire(a1[xrand(&mut rng) as usize % N_ELEM].load(Ordering::Acquire));
                    let old = a2[xrand(&mut rng) as usize % N_ELEM].swap(p, Ordering::AcqRel);
                    release(old);
                }
                read_exit();
            }
        }
    };

    let mutator = |mut rng: u32, a1: Slots, a2: Slots| {
        let live = live.clone();
        move || {
            for i in 0..LOOPS {
                let base = if i & 1 == 1 { &a2 } else { &a1 };
                let index = xrand(&mut rng) as usize % N_ELEM;
                read_enter();
                let p = base[index].load(Ordering::Acquire);
                // SAFETY: p is live inside this section.
                let fresh = make(&live, unsafe { (*p).value().value }.wrapping_mul(2));
                if base[index]
                    .compare_exchange(p, fresh, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: p was displaced; drop the slot's reference.
                    unsafe { release(p) };
                } else {
                    // SAFETY: fresh was never published.
                    unsafe { finalize((*fresh).header().as_ptr()) };
                }
                read_exit();
            }
        }
    };

    let mut handles = Vec::new();
    for g in 0..GROUPS {
        let rng = xrand(&mut seed) ^ g as u32;
        handles.push(thread::spawn(reader(rng, array_1.clone(), array_2.clone())));
        handles.push(thread::spawn(swapper(
            rng.rotate_left(7),
            array_1.clone(),
            array_2.clone(),
        )));
        handles.push(thread::spawn(mutator(
            rng.rotate_left(13),
            array_1.clone(),
            array_2.clone(),
        )));
    }
    for handle in handles {
        handle.join().expect("worker");
    }

    // Every slot owns one reference; drop them all and reclaim.
    for slot in array_1.iter().chain(array_2.iter()) {
        let p = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: p was published in the slot and is live.
        unsafe { release(p) };
    }
    flush().expect("outside any read section");
    assert_eq!(live.load(Ordering::SeqCst), 0, "external live counter drains to zero");
}
