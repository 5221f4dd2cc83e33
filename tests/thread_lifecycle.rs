// Thread handle, lock, and thread-local slot behavior through the public API.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use jacques::api::{Condvar, Mutex, PrivateSlot, ThreadHandle};

#[test]
fn every_join_returns_its_own_result() {
    let handles: Vec<_> = (0..16u64)
        .map(|index| {
            ThreadHandle::spawn(Some(format!("jq-square-{index}").as_str()), move || index * index)
                .expect("spawn")
        })
        .collect();

    for (index, handle) in handles.into_iter().enumerate() {
        let index = index as u64;
        assert_eq!(handle.join().expect("join"), index * index);
    }
}

#[test]
fn second_join_reuses_captured_value() {
    let runs = Arc::new(AtomicUsize::new(0));
    let handle = {
        let runs = Arc::clone(&runs);
        ThreadHandle::spawn(None, move || {
            runs.fetch_add(1, Ordering::SeqCst);
            "done".to_string()
        })
        .expect("spawn")
    };
    let again = handle.clone();

    assert_eq!(handle.join().expect("first"), "done");
    assert!(again.is_finished());
    assert_eq!(again.join().expect("second"), "done");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn handle_can_be_joined_from_another_thread() {
    let target = ThreadHandle::spawn(Some("jq-target"), || 99u32).expect("spawn");
    let joiner_ref = target.clone();
    drop(target);

    let joiner = ThreadHandle::spawn(Some("jq-joiner"), move || {
        joiner_ref.join().map_err(|err| err.to_string())
    })
    .expect("spawn joiner");
    assert_eq!(joiner.join().expect("join joiner"), Ok(99));
}

#[test]
fn handles_carry_their_names() {
    let handle = ThreadHandle::spawn(Some("jq-named"), || ()).expect("spawn");
    assert_eq!(handle.name(), Some("jq-named"));
    let anonymous = ThreadHandle::spawn(None, || ()).expect("spawn");
    assert_eq!(anonymous.name(), None);
    handle.join().expect("join");
    anonymous.join().expect("join");
}

#[cfg(target_os = "linux")]
#[test]
fn os_name_is_visible_inside_entry() {
    let handle = ThreadHandle::spawn(Some("jq-visible"), jacques::api::thread_name::current)
        .expect("spawn");
    assert_eq!(handle.join().expect("join").as_deref(), Some("jq-visible"));
}

#[test]
fn workers_coordinate_through_mutex_and_condvar() {
    struct Board {
        turn: Mutex<usize>,
        changed: Condvar,
    }

    let board = Arc::new(Board {
        turn: Mutex::new(0),
        changed: Condvar::new(),
    });
    // Two players, so a single-waiter signal always reaches the one whose turn it is.
    let players = 2;
    let rounds = 50;

    let handles: Vec<_> = (0..players)
        .map(|seat| {
            let board = Arc::clone(&board);
            ThreadHandle::spawn(Some("jq-player"), move || {
                let mut moves = Vec::new();
                for _ in 0..rounds {
                    let mut turn = board.turn.lock();
                    while *turn % players != seat {
                        turn = board.changed.wait(turn);
                    }
                    moves.push(*turn);
                    *turn += 1;
                    drop(turn);
                    board.changed.signal();
                }
                moves
            })
            .expect("spawn player")
        })
        .collect();

    for (seat, handle) in handles.into_iter().enumerate() {
        let moves = handle.join().expect("join");
        assert_eq!(moves.len(), rounds);
        assert!(moves.iter().all(|turn| turn % players == seat));
    }
    assert_eq!(*board.turn.lock(), players * rounds);
}

#[test]
fn slot_values_stay_per_thread() {
    static WORKER_ID: PrivateSlot<usize> = PrivateSlot::with_drop();

    let handles: Vec<_> = (0..8)
        .map(|id| {
            ThreadHandle::spawn(None, move || {
                WORKER_ID.set(id);
                std::thread::yield_now();
                WORKER_ID.get()
            })
            .expect("spawn")
        })
        .collect();

    for (id, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().expect("join"), Some(id));
    }
    assert_eq!(WORKER_ID.get(), None);
}
