//! End-to-end word count across one and two nodes

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use keyflow::partition::{DefaultHasher, Hasher};
use keyflow::prelude::*;
use keyflow::{CheckpointStorage, MemoryStorage};
use parking_lot::Mutex;

const SENTENCES: [&str; 3] = [
    "to be or not to be doobie doobie da",
    "doobie doobie da",
    "doobie",
];

type Counts = Arc<Mutex<BTreeMap<String, u64>>>;

struct Splitter;

impl ProcessingElement for Splitter {
    fn process(&mut self, event: &Event, ctx: &mut ProcessContext<'_>) -> std::result::Result<(), PeError> {
        let sentence = event.get_str("sentence").ok_or("missing sentence field")?;
        for word in sentence.split_whitespace() {
            ctx.emit("words", Event::builder(word).field("word", word).build());
        }
        Ok(())
    }
}

struct Counter {
    word: String,
    count: u64,
    counts: Counts,
}

impl ProcessingElement for Counter {
    fn process(&mut self, _event: &Event, _ctx: &mut ProcessContext<'_>) -> std::result::Result<(), PeError> {
        self.count += 1;
        self.counts.lock().insert(self.word.clone(), self.count);
        Ok(())
    }

    fn snapshot(&self) -> std::result::Result<Option<Vec<u8>>, PeError> {
        Ok(Some(self.count.to_be_bytes().to_vec()))
    }
}

fn builder(config: RuntimeConfig, view: &Arc<AssignmentView>, counts: &Counts) -> NodeBuilder {
    let counts = Arc::clone(counts);
    Node::builder(config)
        .assignment(Arc::clone(view) as Arc<dyn keyflow::Assignment>)
        .pe_fn("splitter", |_key: &[u8]| Ok(Box::new(Splitter) as Box<dyn ProcessingElement>))
        .pe_fn("counter", move |key: &[u8]| {
            Ok(Box::new(Counter {
                word: String::from_utf8_lossy(key).into_owned(),
                count: 0,
                counts: Arc::clone(&counts),
            }) as Box<dyn ProcessingElement>)
        })
        .subscribe("sentences", "splitter")
        .subscribe("words", "counter")
}

fn emit_sentences(node: &Node) {
    for (i, sentence) in SENTENCES.iter().enumerate() {
        let event = Event::builder(format!("sentence-{i}"))
            .field("sentence", *sentence)
            .build();
        node.emit("sentences", &event).unwrap();
    }
}

fn wait_for_total(counts: &Counts, total: u64) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if counts.lock().values().sum::<u64>() >= total {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {total} words, have {:?}", counts.lock());
}

fn expected() -> BTreeMap<String, u64> {
    [("be", 2), ("da", 2), ("doobie", 5), ("not", 1), ("or", 1), ("to", 2)]
        .into_iter()
        .map(|(w, c)| (w.to_string(), c))
        .collect()
}

fn config(partitions: u32) -> RuntimeConfig {
    RuntimeConfig::new()
        .with_partition_count(partitions)
        .with_num_workers(2)
        .with_handoff_capacity(16)
        .with_max_coordinator_wait(Duration::from_millis(500))
}

#[test]
fn test_word_count_single_node() {
    keyflow::logging::init_for_tests();
    let view = Arc::new(AssignmentView::default());
    let counts: Counts = Arc::default();

    let node = builder(config(4), &view, &counts).start().unwrap();
    let port = node.local_addr().port();
    view.replace(AssignmentSnapshot::new(
        1,
        (0..4).map(|p| ClusterNode::new(p, "127.0.0.1", port)),
    ));

    emit_sentences(&node);
    wait_for_total(&counts, 13);

    assert_eq!(*counts.lock(), expected());
    node.shutdown().unwrap();
}

#[test]
fn test_word_count_two_nodes() {
    keyflow::logging::init_for_tests();
    let view = Arc::new(AssignmentView::default());
    let counts: Counts = Arc::default();

    let a = builder(config(4), &view, &counts).start().unwrap();
    let b = builder(config(4), &view, &counts).start().unwrap();
    let (port_a, port_b) = (a.local_addr().port(), b.local_addr().port());
    view.replace(AssignmentSnapshot::new(
        1,
        [
            ClusterNode::new(0, "127.0.0.1", port_a),
            ClusterNode::new(1, "127.0.0.1", port_b),
            ClusterNode::new(2, "127.0.0.1", port_a),
            ClusterNode::new(3, "127.0.0.1", port_b),
        ],
    ));

    emit_sentences(&a);
    wait_for_total(&counts, 13);

    assert_eq!(*counts.lock(), expected());

    // Each word lives on exactly one node.
    for word in expected().keys() {
        let on_a = a.registry().get("counter", word.as_bytes()).is_some();
        let on_b = b.registry().get("counter", word.as_bytes()).is_some();
        assert!(on_a ^ on_b, "{word} on a={on_a} b={on_b}");
    }

    a.shutdown().unwrap();
    b.shutdown().unwrap();
}

fn counters_on(node: &Node) -> usize {
    node.registry()
        .instances()
        .iter()
        .filter(|i| i.pe_type() == "counter")
        .count()
}

#[test]
fn test_word_count_under_concurrent_load() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 50;

    keyflow::logging::init_for_tests();
    let view = Arc::new(AssignmentView::default());
    let counts: Counts = Arc::default();

    let a = builder(config(4), &view, &counts).start().unwrap();
    let b = builder(config(4), &view, &counts).start().unwrap();
    let (port_a, port_b) = (a.local_addr().port(), b.local_addr().port());
    view.replace(AssignmentSnapshot::new(
        1,
        [
            ClusterNode::new(0, "127.0.0.1", port_a),
            ClusterNode::new(1, "127.0.0.1", port_b),
            ClusterNode::new(2, "127.0.0.1", port_a),
            ClusterNode::new(3, "127.0.0.1", port_b),
        ],
    ));

    thread::scope(|scope| {
        for t in 0..THREADS {
            let node = if t % 2 == 0 { &a } else { &b };
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    for (i, sentence) in SENTENCES.iter().enumerate() {
                        let event = Event::builder(format!("sentence-{t}-{round}-{i}"))
                            .field("sentence", *sentence)
                            .build();
                        node.emit("sentences", &event).unwrap();
                    }
                }
            });
        }
    });

    let repeats = (THREADS * ROUNDS) as u64;
    let total: u64 = expected().values().sum::<u64>() * repeats;
    wait_for_total(&counts, total);

    // Late duplicates would push a count past its expected value.
    thread::sleep(Duration::from_millis(200));
    let want: BTreeMap<String, u64> = expected()
        .into_iter()
        .map(|(word, count)| (word, count * repeats))
        .collect();
    assert_eq!(*counts.lock(), want);

    let hasher = DefaultHasher::new(4).unwrap();
    let on_a = expected()
        .keys()
        .filter(|word| hasher.partition_of_str(word) % 2 == 0)
        .count();
    assert_eq!(counters_on(&a), on_a);
    assert_eq!(counters_on(&b), expected().len() - on_a);

    a.shutdown().unwrap();
    b.shutdown().unwrap();
}

#[test]
fn test_counts_are_checkpointed() {
    keyflow::logging::init_for_tests();
    let view = Arc::new(AssignmentView::default());
    let counts: Counts = Arc::default();
    let storage = Arc::new(MemoryStorage::new());

    let node = builder(config(1), &view, &counts)
        .storage(Arc::clone(&storage) as Arc<dyn CheckpointStorage>)
        .start()
        .unwrap();
    view.replace(AssignmentSnapshot::new(
        1,
        [ClusterNode::new(0, "127.0.0.1", node.local_addr().port())],
    ));

    emit_sentences(&node);
    wait_for_total(&counts, 13);

    // Every counter has applied its last event once all six are dirty.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let dirty = node
            .registry()
            .instances()
            .iter()
            .filter(|i| i.pe_type() == "counter" && i.is_dirty())
            .count();
        if dirty == 6 || Instant::now() > deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    // Splitters keep the default "no snapshot".
    assert_eq!(node.checkpoint_now(), 6);
    assert_eq!(node.checkpoint_now(), 0);

    let doobie = storage.fetch("counter", b"doobie").unwrap().unwrap();
    assert_eq!(doobie, 5u64.to_be_bytes().to_vec());
    node.shutdown().unwrap();
}
