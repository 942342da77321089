//! End-to-end tests for mergeable collections under concurrency.

#[macro_use]
mod common;

use common::*;
use cordon::{
    spawn, Error, ErrorQueue, ErrorQueueConfig, MergeDomain, Placement, QueuePolicy,
    SharedHierarchy, SharedQueue,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_merges_converge_on_one_storage() {
    init_test("concurrent_merges_converge_on_one_storage");
    let domain = MergeDomain::new();
    let queues: Vec<_> = (0..8)
        .map(|i| {
            let q = SharedQueue::in_domain(&domain, 1024, QueuePolicy::Reject);
            q.enqueue(i).expect("room");
            q
        })
        .collect();

    let barrier = Arc::new(Barrier::new(queues.len()));
    let threads: Vec<_> = (0..queues.len())
        .map(|i| {
            let a = queues[i].clone();
            let b = queues[(i + 1) % queues.len()].clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                a.encounter(&b).expect("same domain");
                for n in 0..50 {
                    a.enqueue(100 + i * 100 + n).expect("room");
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("merge thread");
    }

    for q in &queues[1..] {
        assert!(q.shares_storage_with(&queues[0]));
    }
    let len = queues[3].len();
    assert_with_log!(len == 8 + 8 * 50, "no item lost", 408usize, len);
    let merges = domain.merge_count();
    assert_with_log!(merges == 7, "seven effective merges", 7u64, merges);
    test_complete!("concurrent_merges_converge_on_one_storage");
}

#[test]
fn merged_queue_keeps_per_source_order() {
    init_test("merged_queue_keeps_per_source_order");
    let domain = MergeDomain::new();
    let a = SharedQueue::in_domain(&domain, 64, QueuePolicy::DropOldest);
    let b = SharedQueue::in_domain(&domain, 64, QueuePolicy::DropOldest);
    for i in 0..5 {
        a.enqueue(("a", i)).expect("room");
        b.enqueue(("b", i)).expect("room");
    }
    b.encounter(&a).expect("same domain");
    let items = a.to_vec();
    let from_a: Vec<_> = items.iter().filter(|(s, _)| *s == "a").map(|(_, i)| *i).collect();
    let from_b: Vec<_> = items.iter().filter(|(s, _)| *s == "b").map(|(_, i)| *i).collect();
    assert_eq!(from_a, (0..5).collect::<Vec<_>>());
    assert_eq!(from_b, (0..5).collect::<Vec<_>>());
    assert_eq!(items.first(), Some(&("b", 0)));
    test_complete!("merged_queue_keeps_per_source_order");
}

#[test]
fn error_queues_merge_and_harvest_tasks() {
    init_test("error_queues_merge_and_harvest_tasks");
    let domain = MergeDomain::new();
    let pool = ErrorQueue::in_domain(&domain, ErrorQueueConfig::default());
    let request = ErrorQueue::in_domain(&domain, ErrorQueueConfig::default());

    let failing = spawn(async {
        thread::sleep(Duration::from_millis(10));
        Err::<(), _>(Error::user("connection reset"))
    });
    request.register_watched_task(failing.task_ref());
    pool.encounter(&request).expect("same domain");

    assert!(wait_until(Duration::from_secs(5), || !pool.is_empty()));
    let err = pool.throw_first_if_exists().expect_err("harvested");
    assert_eq!(err.message(), Some("connection reset"));
    assert!(request.throw_first_if_exists().is_err());
    test_complete!("error_queues_merge_and_harvest_tasks");
}

#[test]
fn hierarchy_merge_renumbers_contiguously() {
    init_test("hierarchy_merge_renumbers_contiguously");
    let domain = MergeDomain::new();
    let team = SharedHierarchy::in_domain(&domain);
    let lead = team.join("lead", None, Placement::Subordinate).expect("join");
    let dev = team.join("dev", Some(lead), Placement::Subordinate).expect("join");

    let contractors = SharedHierarchy::in_domain(&domain);
    let c1 = contractors.join("c1", None, Placement::Subordinate).expect("join");
    let c2 = contractors.join("c2", None, Placement::Subordinate).expect("join");

    team.encounter_at(&contractors, Some(dev), Placement::Superior)
        .expect("merge");
    let ranks: Vec<_> = [lead, c1, c2, dev]
        .iter()
        .map(|id| contractors.position(*id))
        .collect();
    assert_with_log!(
        ranks == [Some(1), Some(2), Some(3), Some(4)],
        "block placed above dev",
        "1..=4",
        ranks
    );

    contractors.resign(c1).expect("member");
    assert_eq!(team.position(dev), Some(3));
    test_complete!("hierarchy_merge_renumbers_contiguously");
}
