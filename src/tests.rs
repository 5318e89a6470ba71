use std::sync::{
    atomic::{AtomicPtr, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    error::{GcError, TransferError},
    gate::SyncReason,
    gc_state::{GcState, SignalInfo},
    globals::{BONUS_SLOP, HEAP_LIMIT_SLOP},
    header::ObjectTag,
    major::MajorStrategy,
    mutator::{collect_request_size, Mutator},
    object::{self, byte_vector_bytes, byte_vector_size, for_each_object_in_range, null, tag},
    stack,
    tlab::{refill, try_refill_once, AllocationCursor, Refill},
    transfer::{ControlPacket, Interconnect, LoopbackInterconnect},
    Config, Pointer, Ratios,
};

fn config() -> Config {
    Config {
        ram: Some(1 << 30),
        ..Config::default()
    }
}

/// Pushes a root holding a linked list of `len` nodes carrying `0..len`, newest first.
/// Returns the root index.
fn build_list(m: &Mutator, len: usize) -> usize {
    let index = m.roots_len();
    m.push_root(null());
    for i in 0..len {
        let node = m.allocate(1, 1);
        unsafe {
            m.write_word(node, 0, i as u64);
            m.write_ref(node, 0, m.root(index));
        }
        m.set_root(index, node);
    }
    index
}

fn list_values(m: &Mutator, index: usize) -> Vec<u64> {
    let mut values = Vec::new();
    let mut node = m.root(index);
    while !node.is_null() {
        unsafe {
            values.push(m.read_word(node, 0));
            node = m.read_ref(node, 0);
        }
    }
    values
}

fn expected_list(len: usize) -> Vec<u64> {
    (0..len as u64).rev().collect()
}

fn allocate_garbage_until(m: &Mutator, mut done: impl FnMut(&GcState) -> bool) {
    for _ in 0..100_000 {
        if done(m.gc()) {
            return;
        }
        m.allocate_byte_vector(&[0xAB; 1000]);
    }
    panic!("condition not reached: {}", m.gc().statistics());
}

#[test]
fn fast_path_bumps_without_sync() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let before = m.cursor();
    let obj = m.allocate(7, 0);
    let after = m.cursor();
    assert_eq!(obj, before.frontier.wrapping_add(8));
    assert_eq!(after.frontier, before.frontier.wrapping_add(64));
    assert_eq!(after.limit_plus_slop, before.limit_plus_slop);
    assert_eq!(gc.statistics().cumulative.num_gcs, 0);
    assert_eq!(gc.last_sync_reason(), None);
}

#[test]
fn processor_slots_are_exclusive() {
    let gc = GcState::new(Config {
        num_procs: 2,
        ..config()
    });
    let first = gc.mutator(0).unwrap();
    assert!(gc.mutator(0).is_none());
    assert!(gc.mutator(2).is_none());
    let second = gc.mutator(1).unwrap();
    assert_eq!(gc.rendezvous.participants(), 2);
    drop(first);
    assert_eq!(gc.rendezvous.participants(), 1);
    assert!(gc.mutator(0).is_some());
    drop(second);
}

#[test]
fn minor_collection_preserves_reachable_data() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let list = build_list(&m, 300);
    let old_head = m.root(list);
    allocate_garbage_until(&m, |gc| gc.statistics().cumulative.num_minor_gcs >= 1);

    let stats = gc.statistics();
    assert_eq!(stats.cumulative.num_major_gcs(), 0);
    assert!(stats.cumulative.bytes_copied_minor >= 300 * object::normal_size(1, 1));
    assert_eq!(gc.last_sync_reason(), Some(SyncReason::Heap));
    assert_eq!(stats.last_gc_reason, Some(SyncReason::Heap));
    assert_ne!(m.root(list), old_head);
    assert!(gc.heap().contains(m.root(list)));
    assert!(m.root(list) < gc.heap().old_gen_end());
    assert_eq!(list_values(&m, list), expected_list(300));
    unsafe {
        assert!(gc.invariant_for_gc());
    }
}

#[test]
fn old_objects_keep_young_referents_alive() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let holder = m.allocate(1, 0);
    m.push_root(holder);
    allocate_garbage_until(&m, |gc| gc.statistics().cumulative.num_minor_gcs >= 1);
    // The holder is tenured now; point it at a fresh nursery object.
    let young = m.allocate_byte_vector(b"young");
    unsafe {
        m.write_ref(m.root(0), 0, young);
    }
    allocate_garbage_until(&m, |gc| gc.statistics().cumulative.num_minor_gcs >= 2);
    unsafe {
        let young = m.read_ref(m.root(0), 0);
        assert!(young < gc.heap().old_gen_end());
        assert_eq!(m.read_bytes(young), b"young");
    }
}

#[test]
fn forced_collection_runs_major_copy() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let list = build_list(&m, 100);
    let old_gen_before = gc.heap().old_gen_size;

    m.collect(0, true);

    let stats = gc.statistics();
    assert_eq!(gc.last_sync_reason(), Some(SyncReason::Force));
    assert_eq!(stats.last_gc_reason, Some(SyncReason::Force));
    assert_eq!(stats.cumulative.num_gcs, 1);
    assert_eq!(stats.cumulative.num_copying_gcs, 1);
    assert_eq!(stats.cumulative.num_hash_cons_gcs, 0);
    assert_eq!(stats.last_major.strategy, Some(MajorStrategy::Copying));
    assert_eq!(stats.last_major.num_minor_gcs, 0);
    assert_eq!(stats.last_major.bytes_live, gc.heap().old_gen_size);
    assert!(stats.cumulative.max_bytes_live >= stats.last_major.bytes_live);
    assert!(gc.heap().old_gen_size >= old_gen_before);
    assert_eq!(list_values(&m, list), expected_list(100));
    unsafe {
        assert!(gc.invariant_for_gc());
        assert!(gc.invariant_for_mutator_frontier(0));
    }
}

#[test]
fn tight_memory_selects_mark_compact() {
    let gc = GcState::new(Config {
        ram: Some(512 * 1024),
        ..Config::default()
    });
    let m = gc.mutator(0).unwrap();
    let list = build_list(&m, 200);
    m.collect(0, true);

    let stats = gc.statistics();
    assert_eq!(stats.cumulative.num_copying_gcs, 0);
    assert_eq!(stats.cumulative.num_mark_compact_gcs, 1);
    assert_eq!(stats.last_major.strategy, Some(MajorStrategy::MarkCompact));
    assert!(gc.heap().size <= 512 * 1024);
    assert_eq!(list_values(&m, list), expected_list(200));
    unsafe {
        assert!(gc.invariant_for_gc());
    }

    // The heap now fits in memory twice over, so copying is back on the table.
    m.collect(0, true);
    let stats = gc.statistics();
    assert_eq!(stats.cumulative.num_copying_gcs, 1);
    assert_eq!(stats.last_major.strategy, Some(MajorStrategy::Copying));
    assert_eq!(list_values(&m, list), expected_list(200));
}

#[test]
fn forced_mark_compact_reclaims_garbage() {
    let gc = GcState::new(Config {
        force_mark_compact: true,
        ..config()
    });
    let m = gc.mutator(0).unwrap();
    let list = build_list(&m, 50);
    m.collect(0, true);
    let live = gc.heap().old_gen_size;

    // Tenure some objects, then drop them and compact them away again.
    for _ in 0..20 {
        let obj = m.allocate_byte_vector(&[1; 100]);
        m.push_root(obj);
    }
    m.collect(0, true);
    assert_eq!(gc.heap().old_gen_size, live + 20 * byte_vector_size(100));
    for _ in 0..20 {
        m.pop_root();
    }
    m.collect(0, true);
    assert_eq!(gc.heap().old_gen_size, live);
    assert_eq!(gc.statistics().cumulative.num_mark_compact_gcs, 3);
    assert_eq!(list_values(&m, list), expected_list(50));
}

#[test]
fn hash_consing_merges_equal_byte_vectors() {
    let gc = GcState::new(Config {
        ratios: Ratios {
            hash_cons: 1.0,
            ..Ratios::default()
        },
        ..config()
    });
    let m = gc.mutator(0).unwrap();
    let array = m.allocate_ref_array(4);
    m.push_root(array);
    for i in 0..4 {
        let bytes = m.allocate_byte_vector(b"dup");
        unsafe {
            m.write_ref(m.root(0), i, bytes);
        }
    }

    // The first major collection has no history to throttle against.
    m.collect(0, true);
    assert_eq!(gc.statistics().cumulative.num_hash_cons_gcs, 0);
    m.collect(0, true);

    let stats = gc.statistics();
    assert_eq!(stats.cumulative.num_copying_gcs, 1);
    assert_eq!(stats.cumulative.num_hash_cons_gcs, 1);
    assert_eq!(stats.last_major.strategy, Some(MajorStrategy::MarkCompact));
    assert_eq!(stats.cumulative.bytes_hash_consed, 3 * byte_vector_size(3));
    unsafe {
        let array = m.root(0);
        let first = m.read_ref(array, 0);
        for i in 1..4 {
            assert_eq!(m.read_ref(array, i), first);
        }
        assert_eq!(m.read_bytes(first), b"dup");
    }
}

#[test]
fn peak_live_is_monotonic() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let list = build_list(&m, 10);
    let mut peak = 0;
    for round in 0..6 {
        let extra = build_list(&m, 50 * (round % 3));
        let live_before = gc.heap().old_gen_size + gc.heap().nursery_size();
        m.collect(0, true);
        let stats = gc.statistics();
        assert!(stats.cumulative.max_bytes_live >= peak);
        assert!(stats.last_major.bytes_live <= live_before);
        peak = stats.cumulative.max_bytes_live;
        let top = m.root(extra);
        assert_eq!(m.pop_root(), top);
    }
    assert_eq!(list_values(&m, list), expected_list(10));
}

#[test]
fn random_operations_keep_invariants() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: Vec<Vec<u8>> = Vec::new();

    for _ in 0..3000 {
        match rng.gen_range(0..10) {
            0..=3 => {
                let len = rng.gen_range(0..600);
                let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let obj = m.allocate_byte_vector(&bytes);
                m.push_root(obj);
                model.push(bytes);
            }
            4 | 5 => {
                m.allocate(rng.gen_range(0..4), rng.gen_range(0..4));
            }
            6 => {
                m.allocate_ref_array(rng.gen_range(0..64));
            }
            7 => {
                if model.pop().is_some() {
                    m.pop_root();
                }
            }
            _ => {
                let bytes = rng.gen_range(0..64 * 1024);
                let force = rng.gen_bool(0.2);
                m.collect(bytes, force);
                unsafe {
                    assert!(gc.invariant_for_gc());
                    assert!(gc.invariant_for_mutator_frontier(0));
                    assert!(gc.invariant_for_mutator_stack(0));
                }
            }
        }
    }

    assert_eq!(m.roots_len(), model.len());
    for (i, bytes) in model.iter().enumerate() {
        unsafe {
            assert_eq!(tag(m.root(i)), ObjectTag::ByteVector);
            assert_eq!(&m.read_bytes(m.root(i)), bytes);
        }
    }
}

#[test]
fn workers_collect_together() {
    const WORKERS: usize = 4;
    let gc = GcState::new(Config {
        num_procs: WORKERS,
        initial_heap_size: 256 * 1024,
        ..config()
    });
    crossbeam_utils::thread::scope(|scope| {
        for proc in 0..WORKERS {
            let gc = gc.clone();
            scope.spawn(move |_| {
                let m = gc.mutator(proc).unwrap();
                let list = build_list(&m, 100 + proc);
                for round in 0..2000 {
                    m.allocate_byte_vector(&[proc as u8; 200]);
                    if round % 500 == 0 {
                        assert_eq!(list_values(&m, list), expected_list(100 + proc));
                    }
                }
                assert_eq!(list_values(&m, list), expected_list(100 + proc));
            });
        }
    })
    .unwrap();
    assert!(gc.statistics().cumulative.num_gcs > 0);
    unsafe {
        assert!(gc.invariant_for_gc());
    }
}

#[test]
fn lost_refill_race_retries_at_new_frontier() {
    let mut arena = vec![0u64; 64];
    let base = arena.as_mut_ptr().cast::<u8>();
    let end = base.wrapping_add(64 * 8);
    let shared = AtomicPtr::new(base);
    let mut winner = AllocationCursor::empty();
    let mut loser = AllocationCursor::empty();

    let seen = shared.load(Ordering::Acquire);
    let won = try_refill_once(&shared, seen, end, &mut winner, 128);
    assert_eq!(
        won,
        Ok(Refill::Refilled {
            contiguous: false,
            claimed_start: base as usize,
            claimed_end: base as usize + 128 + BONUS_SLOP,
        })
    );
    // The loser read the frontier before the winner's swap.
    let current = try_refill_once(&shared, seen, end, &mut loser, 128).unwrap_err();
    assert_eq!(current, base.wrapping_add(128 + BONUS_SLOP));
    assert_eq!(loser, AllocationCursor::empty());

    let retried = try_refill_once(&shared, current, end, &mut loser, 128).unwrap();
    assert!(matches!(retried, Refill::Refilled { contiguous: false, .. }));
    assert_eq!(loser.start, current);
    assert_eq!(shared.load(Ordering::Acquire), base.wrapping_add(2 * (128 + BONUS_SLOP)));

    // 512 - 288 = 224 bytes remain, not enough for another 256.
    let frontier = shared.load(Ordering::Acquire);
    let mut late = AllocationCursor::empty();
    assert_eq!(
        try_refill_once(&shared, frontier, end, &mut late, 256),
        Ok(Refill::Declined)
    );
    assert_eq!(shared.load(Ordering::Acquire), frontier);
}

#[test]
fn concurrent_refills_tile_the_arena() {
    const THREADS: usize = 4;
    const WORDS: usize = 64 * 1024;
    let mut arena = vec![0u64; WORDS];
    let base = arena.as_mut_ptr().cast::<u8>();
    let end = base.wrapping_add(WORDS * 8);
    let shared = AtomicPtr::new(base);
    let cursors = Mutex::new(Vec::new());
    let end_addr = end as usize;

    crossbeam_utils::thread::scope(|scope| {
        for thread in 0..THREADS {
            let shared = &shared;
            let cursors = &cursors;
            scope.spawn(move |_| {
                let end = end_addr as Pointer;
                let mut cursor = AllocationCursor::empty();
                let mut count = 0usize;
                let size = byte_vector_size(8);
                let marker = 0xC0 | thread as u8;
                loop {
                    if cursor.bytes_free() < size {
                        if refill(shared, end, &mut cursor, 24 * size) == Refill::Declined {
                            break;
                        }
                    }
                    let at = cursor.bump(size);
                    unsafe {
                        object::write_byte_vector(at, &[marker; 8]);
                    }
                    count += 1;
                }
                let (tail_start, tail_end) = cursor.unused_tail();
                cursors
                    .lock()
                    .push((thread, tail_start as usize, tail_end as usize, count));
            });
        }
    })
    .unwrap();

    let cursors = cursors.into_inner();
    for &(_, tail_start, tail_end, _) in cursors.iter() {
        crate::filler::fill_gap(tail_start as Pointer, tail_end as Pointer);
    }
    let mut counted = [0usize; THREADS];
    unsafe {
        for_each_object_in_range(base, shared.load(Ordering::Acquire), |obj| {
            // Fillers of 32 bytes look like byte vectors too, but hold zeroes.
            if tag(obj) == ObjectTag::ByteVector
                && object::array_length(obj) == 8
                && byte_vector_bytes(obj)[0] & 0xF0 == 0xC0
            {
                let marker = byte_vector_bytes(obj)[0];
                assert!(byte_vector_bytes(obj).iter().all(|&b| b == marker));
                counted[(marker & 0x0F) as usize] += 1;
            }
        });
    }
    for (thread, _, _, count) in cursors {
        assert_eq!(counted[thread], count, "objects of thread {}", thread);
    }
    drop(arena);
}

#[test]
fn closures_round_trip_between_nodes() {
    let sender_gc = GcState::new(config());
    let receiver_gc = GcState::new(config());
    let sender = sender_gc.mutator(0).unwrap();
    let receiver = receiver_gc.mutator(0).unwrap();
    let nodes = LoopbackInterconnect::network(2);

    unsafe {
        // No references.
        let flat = sender.allocate(0, 2);
        sender.write_word(flat, 0, 7);
        sender.write_word(flat, 1, 9);
        sender.send(&nodes[0], flat, 1).unwrap();
        let got = receiver.recv(&nodes[1], 0).unwrap();
        assert!(receiver_gc.heap().contains(got));
        assert_eq!((receiver.read_word(got, 0), receiver.read_word(got, 1)), (7, 9));
        receiver.push_root(got);

        // One reference.
        let pair = sender.allocate(1, 1);
        sender.push_root(pair);
        let payload = sender.allocate_byte_vector(b"payload");
        let pair = sender.root(0);
        sender.write_ref(pair, 0, payload);
        sender.write_word(pair, 0, 42);
        sender.send(&nodes[0], pair, 1).unwrap();
        let got = receiver.recv(&nodes[1], 0).unwrap();
        assert_eq!(receiver.read_word(got, 0), 42);
        assert_eq!(receiver.read_bytes(receiver.read_ref(got, 0)), b"payload");
        receiver.push_root(got);

        // A cycle through a shared subobject.
        let outer = sender.allocate(2, 0);
        sender.push_root(outer);
        let shared = sender.allocate(1, 1);
        let outer = sender.root(1);
        sender.write_ref(outer, 0, shared);
        sender.write_ref(outer, 1, shared);
        sender.write_ref(shared, 0, outer);
        sender.write_word(shared, 0, 5);
        sender.send(&nodes[0], outer, 1).unwrap();
        let got = receiver.recv(&nodes[1], 0).unwrap();
        receiver.push_root(got);

        let check = |m: &Mutator| {
            let flat = m.root(0);
            assert_eq!((m.read_word(flat, 0), m.read_word(flat, 1)), (7, 9));
            let pair = m.root(1);
            assert_eq!(m.read_bytes(m.read_ref(pair, 0)), b"payload");
            let outer = m.root(2);
            let shared = m.read_ref(outer, 0);
            assert_eq!(m.read_ref(outer, 1), shared);
            assert_eq!(m.read_ref(shared, 0), outer);
            assert_eq!(m.read_word(shared, 0), 5);
        };
        check(&receiver);
        // Sending leaves the sender's graph alone.
        let outer = sender.root(1);
        assert_eq!(sender.read_ref(sender.read_ref(outer, 0), 0), outer);

        receiver.collect(0, true);
        check(&receiver);
    }
}

#[test]
fn transfer_rejects_bad_requests() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let nodes = LoopbackInterconnect::network(2);

    let obj = m.allocate(0, 1);
    assert!(matches!(
        m.send(&nodes[0], obj, 0),
        Err(TransferError::SelfSend(0))
    ));

    m.send(&nodes[1], null(), 0).unwrap();
    assert!(m.recv(&nodes[0], 1).unwrap().is_null());

    let bogus = ControlPacket {
        closure_size: 12,
        remote_base: 0x1000,
    };
    nodes[1].send(&bogus.encode(), 0).unwrap();
    assert!(matches!(
        m.recv(&nodes[0], 1),
        Err(TransferError::MalformedPacket(12))
    ));
}

#[test]
fn received_references_must_stay_inside_the_closure() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let nodes = LoopbackInterconnect::network(2);

    let mut closure = vec![0u64; 2];
    let size = object::normal_size(1, 0);
    unsafe {
        let obj = object::write_normal(closure.as_mut_ptr().cast(), 1, 0);
        *object::field(obj, 0) = 0x10 as Pointer;
    }
    let packet = ControlPacket {
        closure_size: size,
        remote_base: 0x1000,
    };
    let bytes = unsafe { std::slice::from_raw_parts(closure.as_ptr().cast::<u8>(), size) };
    nodes[1].send(&packet.encode(), 0).unwrap();
    nodes[1].send(bytes, 0).unwrap();
    match m.recv(&nodes[0], 1) {
        Err(TransferError::DanglingReference {
            target,
            remote_base,
            closure_size,
        }) => assert_eq!((target, remote_base, closure_size), (0x10, 0x1000, size)),
        other => panic!("unexpected {:?}", other),
    }

    // The rejected bytes are dead space and the heap still collects.
    m.collect(0, true);
    unsafe {
        assert!(gc.invariant_for_gc());
    }
    let list = build_list(&m, 3);
    m.collect(0, true);
    assert_eq!(list_values(&m, list), expected_list(3));
}

#[test]
fn oversized_collect_requests_are_exhaustion() {
    let chunk = 4096;
    let capacity = 1 << 20;
    assert_eq!(collect_request_size(0, chunk, capacity), Ok(chunk));
    assert_eq!(
        collect_request_size(chunk + 1, chunk, capacity),
        Ok(chunk + 8 + HEAP_LIMIT_SLOP)
    );
    for bytes in [capacity, usize::MAX - 100, usize::MAX] {
        assert_eq!(
            collect_request_size(bytes, chunk, capacity),
            Err(GcError::ResourceExhaustion {
                needed: bytes.saturating_add(HEAP_LIMIT_SLOP),
                limit: capacity,
            })
        );
    }

    // The allocator declines instead of wrapping around.
    let mut arena = vec![0u64; 64];
    let base = arena.as_mut_ptr().cast::<u8>();
    let shared = AtomicPtr::new(base);
    let mut cursor = AllocationCursor::empty();
    for bytes in [usize::MAX - 100, usize::MAX - 15, usize::MAX] {
        assert_eq!(
            refill(&shared, base.wrapping_add(64 * 8), &mut cursor, bytes),
            Refill::Declined
        );
    }
    assert_eq!(shared.load(Ordering::Relaxed), base);
}

#[test]
fn gc_signal_is_delivered_after_collection() {
    let gc = GcState::new(config());
    let seen: Arc<Mutex<Vec<SignalInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    gc.set_gc_signal_handler(move |info| sink.lock().push(*info));
    let m = gc.mutator(0).unwrap();

    m.collect(0, true);
    assert_eq!(
        *seen.lock(),
        vec![SignalInfo {
            proc: 0,
            gc_signal: true
        }]
    );

    m.raise_signal();
    m.collect(0, false);
    assert_eq!(gc.last_sync_reason(), Some(SyncReason::Signals));
    assert_eq!(gc.statistics().cumulative.num_gcs, 1);
    assert_eq!(seen.lock().len(), 2);
    assert!(!seen.lock()[1].gc_signal);
}

#[test]
fn root_stack_grows_on_demand() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    let initial = unsafe { stack::reserved(gc.proc(0).current_stack) };
    for i in 0..300 {
        let obj = m.allocate(0, 1);
        unsafe {
            m.write_word(obj, 0, i);
        }
        m.push_root(obj);
    }
    unsafe {
        let current = gc.proc(0).current_stack;
        assert!(stack::reserved(current) > initial);
        assert!(gc.invariant_for_mutator_stack(0));
    }
    m.collect(0, true);
    assert_eq!(m.roots_len(), 300);
    for i in 0..300 {
        unsafe {
            assert_eq!(m.read_word(m.root(i), 0), i as u64);
        }
    }
}

#[test]
fn nursery_is_absorbed_without_generations() {
    let gc = GcState::new(Config {
        generational: false,
        ..config()
    });
    let m = gc.mutator(0).unwrap();
    let list = build_list(&m, 64);
    allocate_garbage_until(&m, |gc| gc.statistics().cumulative.num_gcs >= 3);

    let stats = gc.statistics();
    assert_eq!(stats.cumulative.num_minor_gcs, 0);
    assert!(stats.cumulative.num_major_gcs() >= 1);
    assert!(!gc.heap().can_minor);
    assert_eq!(gc.heap().nursery, gc.heap().old_gen_end());
    assert_eq!(list_values(&m, list), expected_list(64));
    unsafe {
        assert!(gc.invariant_for_gc());
    }
}

#[test]
fn shared_heap_declines_when_full() {
    let gc = GcState::new(Config {
        shared_heap_size: 4096,
        ..config()
    });
    let m = gc.mutator(0).unwrap();
    let first = m.allocate_shared_bytes(b"interned").unwrap();
    assert!(gc.shared_heap().contains(first));
    let mut count = 1;
    while m.allocate_shared_bytes(&[0; 100]).is_some() {
        count += 1;
    }
    assert!(count > 1 && count < 4096 / 100);

    // Old objects may point into the shared heap across collections.
    let holder = m.allocate(1, 0);
    unsafe {
        m.write_ref(holder, 0, first);
    }
    m.push_root(holder);
    m.collect(0, true);
    unsafe {
        let first_again = m.read_ref(m.root(0), 0);
        assert_eq!(first_again, first);
        assert_eq!(m.read_bytes(first_again), b"interned");
    }
}

#[test]
fn ffi_pointer_is_opaque() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    assert!(m.ffi_op_args_res_ptr().is_null());
    let marker = 0x1234usize as Pointer;
    m.set_ffi_op_args_res_ptr(marker);
    m.set_exn_stack(16);
    m.collect(0, true);
    assert_eq!(m.ffi_op_args_res_ptr(), marker);
    unsafe {
        assert_eq!(object::thread_exn_stack(gc.proc(0).current_thread), 16);
    }
}

#[test]
fn statistics_counters_add_up() {
    let gc = GcState::new(config());
    let m = gc.mutator(0).unwrap();
    m.collect(0, true);
    allocate_garbage_until(&m, |gc| gc.statistics().cumulative.num_gcs >= 2);
    let stats = gc.statistics();
    assert_eq!(stats.cumulative.num_minor_gcs, 2);
    assert!(stats.cumulative.num_gcs >= 2);
    assert!(stats.cumulative.num_gcs >= stats.cumulative.num_major_gcs());
    assert!(stats.cumulative.gc_time >= stats.cumulative.max_pause);
    assert!(stats.to_string().contains("copying collections: 1"));
}
