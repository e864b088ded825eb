use std::collections::BTreeMap;
use std::ops::Bound;

use tempfile::tempdir;

use crate::iterators::StorageIterator;
use crate::lsm::Lsm;
use crate::options::LsmOptions;

#[test]
fn basic_operations() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();

    store.put(b"key1", b"value1").unwrap();
    assert_eq!(store.get(b"key1").unwrap().unwrap().as_ref(), b"value1");

    store.put(b"key1", b"new_value").unwrap();
    assert_eq!(store.get(b"key1").unwrap().unwrap().as_ref(), b"new_value");

    store.remove(b"key1").unwrap();
    assert!(store.get(b"key1").unwrap().is_none());

    assert!(store.get(b"nonexistent").unwrap().is_none());
}

#[test]
fn persistence_across_reopen() {
    let dir = tempdir().unwrap();
    let mut live = BTreeMap::new();
    {
        let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();
        for i in 0..100 {
            let key = format!("key{}", i);
            let value = format!("value{}", i);
            store.put(key.as_bytes(), value.as_bytes()).unwrap();
            live.insert(key, value);
            // Drop an older key once ten newer ones exist.
            if i % 10 == 0 && i != 0 {
                let stale = format!("key{}", i - 10);
                store.remove(stale.as_bytes()).unwrap();
                live.remove(&stale);
            }
        }
        store.close().unwrap();
    }

    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();
    for i in 0..100 {
        let key = format!("key{}", i);
        let got = store.get(key.as_bytes()).unwrap();
        match live.get(&key) {
            Some(value) => assert_eq!(got.unwrap().as_ref(), value.as_bytes(), "{}", key),
            None => assert!(got.is_none(), "{} should stay deleted", key),
        }
    }
    assert!(store.get(b"nonexistent").unwrap().is_none());
}

#[test]
fn predicate_scan_spans_memory_and_disk() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();

    for i in 0..100 {
        store
            .put(
                format!("key{:02}", i).as_bytes(),
                format!("value{:02}", i).as_bytes(),
            )
            .unwrap();
        if i == 50 {
            store.flush().unwrap();
        }
    }

    let predicate = |key: &[u8]| -> i32 {
        let n: i32 = std::str::from_utf8(&key[3..]).unwrap().parse().unwrap();
        if n < 20 {
            1
        } else if n > 60 {
            -1
        } else {
            0
        }
    };
    let mut iter = store.iters_monotony_predicate(&predicate).unwrap().unwrap();
    let mut seen = Vec::new();
    while iter.is_valid() {
        seen.push(String::from_utf8(iter.key().to_vec()).unwrap());
        assert_eq!(&iter.value()[5..], &iter.key()[3..]);
        iter.next().unwrap();
    }
    let expected: Vec<String> = (20..=60).map(|i| format!("key{:02}", i)).collect();
    assert_eq!(seen, expected);
}

#[test]
fn predicate_scan_with_no_match_is_none() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();
    store.put(b"aaa", b"1").unwrap();
    let predicate = |key: &[u8]| -> i32 {
        if key < b"zzz".as_slice() {
            1
        } else {
            -1
        }
    };
    assert!(store.iters_monotony_predicate(&predicate).unwrap().is_none());
}

#[test]
fn prefix_scan_returns_the_live_sorted_set() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();

    store.put(b"abc", b"1").unwrap();
    store.put(b"abcd", b"2").unwrap();
    store.put(b"abcde", b"3").unwrap();
    store.put(b"aaa", b"noise").unwrap();
    store.put(b"xyz", b"noise").unwrap();
    store.flush().unwrap();

    store.remove(b"abcd").unwrap();
    store.put(b"abcdef", b"4").unwrap();
    store.put(b"abzz", b"5").unwrap();

    let mut iter = store.scan_prefix(b"ab").unwrap().unwrap();
    let mut seen = Vec::new();
    while iter.is_valid() {
        seen.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next().unwrap();
    }
    assert_eq!(
        seen,
        vec![
            (b"abc".to_vec(), b"1".to_vec()),
            (b"abcde".to_vec(), b"3".to_vec()),
            (b"abcdef".to_vec(), b"4".to_vec()),
            (b"abzz".to_vec(), b"5".to_vec()),
        ]
    );

    assert!(store.scan_prefix(b"nope").unwrap().is_none());
}

#[test]
fn forward_iteration_matches_a_map_oracle() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();
    let mut oracle = BTreeMap::new();

    for i in 0..300usize {
        let key = format!("key{:02}", i % 50);
        if i % 7 == 3 {
            store.remove(key.as_bytes()).unwrap();
            oracle.remove(&key);
        } else {
            let value = format!("value{}", i);
            store.put(key.as_bytes(), value.as_bytes()).unwrap();
            oracle.insert(key, value);
        }
        if i == 150 {
            store.flush().unwrap();
        }
    }

    let mut iter = store.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    let mut seen = Vec::new();
    while iter.is_valid() {
        seen.push((
            String::from_utf8(iter.key().to_vec()).unwrap(),
            String::from_utf8(iter.value().to_vec()).unwrap(),
        ));
        iter.next().unwrap();
    }
    let expected: Vec<(String, String)> = oracle
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    assert_eq!(seen, expected);
}

#[test]
fn bounded_scans_clip_both_ends() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();
    for i in 0..10 {
        store
            .put(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }
    store.flush().unwrap();

    let mut iter = store
        .scan(Bound::Excluded(b"k2".as_slice()), Bound::Excluded(b"k7".as_slice()))
        .unwrap();
    let mut seen = Vec::new();
    while iter.is_valid() {
        seen.push(String::from_utf8(iter.key().to_vec()).unwrap());
        iter.next().unwrap();
    }
    assert_eq!(seen, vec!["k3", "k4", "k5", "k6"]);
}

#[test]
fn large_scale_operations_survive_flush_and_compaction() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::small_for_test()).unwrap();

    let mut data = Vec::new();
    for i in 0..1000 {
        let key = format!("key{:04}", i);
        let value = format!("value{:04}", i);
        store.put(key.as_bytes(), value.as_bytes()).unwrap();
        data.push((key, value));
    }

    // The tiny budgets force many flushes and at least one
    // compaction pass.
    let snapshot = store.engine().snapshot();
    assert!(snapshot
        .level_sst_ids
        .range(1..)
        .any(|(_, ids)| !ids.is_empty()));

    for (key, value) in &data {
        assert_eq!(
            store.get(key.as_bytes()).unwrap().unwrap().as_ref(),
            value.as_bytes(),
            "{}",
            key
        );
    }

    let mut iter = store.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    let mut count = 0;
    while iter.is_valid() {
        count += 1;
        iter.next().unwrap();
    }
    assert_eq!(count, 1000);
}

#[test]
fn mixed_operations_settle_to_the_reference_state() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();
    let mut reference = BTreeMap::new();

    store.put(b"key1", b"value1").unwrap();
    reference.insert(b"key1".to_vec(), b"value1".to_vec());
    store.put(b"key2", b"value2").unwrap();
    reference.insert(b"key2".to_vec(), b"value2".to_vec());
    store.remove(b"key1").unwrap();
    reference.remove(b"key1".as_slice());
    store.put(b"key3", b"value3").unwrap();
    reference.insert(b"key3".to_vec(), b"value3".to_vec());

    for (key, value) in &reference {
        assert_eq!(store.get(key).unwrap().unwrap().as_ref(), value.as_slice());
    }
    assert!(store.get(b"key1").unwrap().is_none());
}

#[test]
fn batched_facade_calls_round_trip() {
    let dir = tempdir().unwrap();
    let store = Lsm::open(dir.path(), LsmOptions::default()).unwrap();
    store
        .put_batch(&[
            (b"a".as_slice(), b"1".as_slice()),
            (b"b".as_slice(), b"2".as_slice()),
        ])
        .unwrap();
    store.remove_batch(&[b"a".as_slice()]).unwrap();

    let values = store
        .get_batch(&[b"a".as_slice(), b"b".as_slice()])
        .unwrap();
    assert!(values[0].is_none());
    assert_eq!(values[1].as_ref().unwrap().as_ref(), b"2");
}
