use super::*;
use crate::operator::{SchedulingStrategy, TupleAvailabilityByCount};
use crate::tuplequeue::{GreedyDrainer, TupleCountDrainer};

use TupleAvailabilityByPort::{AllPorts, AnyPort};

fn key(k: i64) -> PartitionKey {
    PartitionKey::single(k)
}

fn tuple(k: i64, v: i64) -> Tuple {
    Tuple::new().with("key", k).with("value", v)
}

fn count_drainer(by_port: TupleAvailabilityByPort, counts: Vec<usize>) -> TupleCountDrainer {
    let strategy = SchedulingStrategy::on_ports(by_port, TupleAvailabilityByCount::AtLeast, counts);
    TupleCountDrainer::new(strategy.tuple_availability().unwrap().clone())
}

#[test]
fn test_offer_makes_key_drainable_with_default_counts() {
    let mut container = TupleQueueContainer::new("op", 1, 0);
    assert!(container.offer(0, tuple(1, 1), key(1)));
    // already drainable
    assert!(!container.offer(0, tuple(1, 2), key(1)));
    assert_eq!(container.drainable_key_count(), 1);
}

#[test]
fn test_any_port_thresholds() {
    let mut container = TupleQueueContainer::new("op", 2, 0);
    container.set_tuple_counts(&[2, 1], AnyPort).unwrap();

    assert!(!container.offer(0, tuple(1, 1), key(1)));
    assert_eq!(container.drainable_key_count(), 0);
    assert!(container.offer(0, tuple(1, 2), key(1)));

    // the second port alone also suffices
    assert!(container.offer(1, tuple(2, 1), key(2)));
    assert_eq!(container.drainable_key_count(), 2);

    let mut drainer = count_drainer(AnyPort, vec![2, 1]);
    let mut removed = 0;
    while container.drainable_key_count() > 0 {
        removed += container.drain(false, &mut drainer);
        let (drained_key, tuples) = drainer.take();
        assert!(drained_key.is_some());
        assert!(!tuples.is_empty());
    }
    assert_eq!(removed, 2);
    assert!(container.is_empty());
}

#[test]
fn test_key_stops_being_drainable_when_drain_leaves_ports_below_threshold() {
    let mut container = TupleQueueContainer::new("op", 2, 0);
    container.set_tuple_counts(&[2, 1], AnyPort).unwrap();
    container.offer(0, tuple(1, 1), key(1));
    container.offer(0, tuple(1, 2), key(1));

    let strategy =
        SchedulingStrategy::on_ports(AnyPort, TupleAvailabilityByCount::Exact, vec![2, 1]);
    let mut drainer = TupleCountDrainer::new(strategy.tuple_availability().unwrap().clone());
    assert_eq!(container.drain(false, &mut drainer), 1);
    assert_eq!(drainer.result().tuple_count(0), 2);
    assert_eq!(container.drainable_key_count(), 0);
}

#[test]
fn test_all_ports_requires_every_port() {
    let mut container = TupleQueueContainer::new("op", 2, 0);
    container.set_tuple_counts(&[1, 1], AllPorts).unwrap();
    assert!(!container.offer(0, tuple(1, 1), key(1)));
    assert!(!container.offer(0, tuple(1, 2), key(1)));
    assert!(container.offer(1, tuple(1, 3), key(1)));

    let mut drainer = count_drainer(AllPorts, vec![1, 1]);
    container.drain(false, &mut drainer);
    let (_, tuples) = drainer.take();
    assert_eq!(tuples.tuple_count(0), 2);
    assert_eq!(tuples.tuple_count(1), 1);
}

#[test]
fn test_set_tuple_counts_rescans_all_keys() {
    let mut container = TupleQueueContainer::new("op", 2, 0);
    container.set_tuple_counts(&[1, 1], AllPorts).unwrap();
    container.offer(0, tuple(1, 1), key(1));
    container.offer(1, tuple(2, 1), key(2));
    assert_eq!(container.drainable_key_count(), 0);

    container.set_tuple_counts(&[1, 1], AnyPort).unwrap();
    assert_eq!(container.drainable_key_count(), 2);

    container.set_tuple_counts(&[3, 3], AnyPort).unwrap();
    assert_eq!(container.drainable_key_count(), 0);
}

#[test]
fn test_set_tuple_counts_validates_port_count() {
    let mut container = TupleQueueContainer::new("op", 2, 0);
    assert!(container.set_tuple_counts(&[1], AnyPort).is_err());
}

#[test]
fn test_greedy_drain_takes_non_drainable_keys() {
    let mut container = TupleQueueContainer::new("op", 2, 0);
    container.set_tuple_counts(&[5, 5], AllPorts).unwrap();
    container.offer(0, tuple(1, 1), key(1));
    container.offer(1, tuple(2, 1), key(2));

    let mut drainer = GreedyDrainer::new(2);
    let mut drained = 0;
    loop {
        container.drain(false, &mut drainer);
        let (drained_key, tuples) = drainer.take();
        if tuples.is_empty() {
            assert!(drained_key.is_none());
            break;
        }
        drained += tuples.total_count();
    }
    assert_eq!(drained, 2);
    assert_eq!(container.key_count(), 0);
}

#[test]
fn test_greedy_drain_counts_removed_drainable_keys() {
    let mut container = TupleQueueContainer::new("op", 1, 0);
    container.offer(0, tuple(1, 1), key(1));
    let mut drainer = GreedyDrainer::new(1);
    assert_eq!(container.drain(false, &mut drainer), 1);
    assert_eq!(container.drainable_key_count(), 0);
}

#[test]
fn test_available_tuple_counts_and_clear() {
    let mut container = TupleQueueContainer::new("op", 2, 3);
    container.offer(0, tuple(1, 1), key(1));
    container.offer(1, tuple(2, 1), key(2));
    container.offer(1, tuple(2, 2), key(2));

    let mut counts = vec![0, 0];
    container.add_available_tuple_counts(&mut counts);
    assert_eq!(counts, vec![1, 2]);

    assert_eq!(container.clear(), 3);
    assert!(container.is_empty());
    assert_eq!(container.drainable_key_count(), 0);
    assert_eq!(container.partition_id(), 3);
}
