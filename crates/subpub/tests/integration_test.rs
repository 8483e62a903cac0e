//! Integration tests for the bus under concurrent use

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use subpub::{Error, SubPub};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

type Received = Arc<Mutex<Vec<(usize, usize)>>>;

fn recording_handler(received: &Received) -> impl Fn((usize, usize)) -> std::future::Ready<()> + use<> {
    let received = Arc::clone(received);
    move |message| {
        received.lock().push(message);
        std::future::ready(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_keep_per_publisher_order() {
    const PUBLISHERS: usize = 8;
    const MESSAGES: usize = 500;

    let _ = tracing_subscriber::fmt::try_init();

    // Small queue so most messages go through the overflow path.
    let bus = SubPub::<(usize, usize)>::with_queue_capacity(4);

    let subscribers: Vec<Received> = (0..3).map(|_| Arc::default()).collect();
    for received in &subscribers {
        bus.subscribe("load", recording_handler(received)).unwrap();
    }

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|publisher| {
            let bus = bus.clone();
            tokio::spawn(async move {
                for sequence in 0..MESSAGES {
                    bus.publish("load", (publisher, sequence)).unwrap();
                    if sequence % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();

    for publisher in publishers {
        publisher.await.unwrap();
    }

    bus.close_timeout(Duration::from_secs(10)).await.unwrap();

    for received in &subscribers {
        let received = received.lock();
        assert_eq!(received.len(), PUBLISHERS * MESSAGES);

        // Each publisher's messages must arrive in publish order.
        let mut next: HashMap<usize, usize> = HashMap::new();
        for (publisher, sequence) in received.iter().copied() {
            let expected = next.entry(publisher).or_insert(0);
            assert_eq!(sequence, *expected, "publisher {publisher} out of order");
            *expected += 1;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocked_handler_does_not_delay_other_subjects() {
    let bus = SubPub::<(usize, usize)>::with_queue_capacity(1);
    let gate = CancellationToken::new();

    let handler_gate = gate.clone();
    bus.subscribe("stuck", move |_: (usize, usize)| {
        let gate = handler_gate.clone();
        async move { gate.cancelled().await }
    })
    .unwrap();

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe("live", move |message: (usize, usize)| {
        let _ = sender.send(message);
        std::future::ready(())
    })
    .unwrap();

    for sequence in 0..100 {
        bus.publish("stuck", (0, sequence)).unwrap();
        bus.publish("live", (1, sequence)).unwrap();
    }

    for sequence in 0..100 {
        let message = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("live subscriber starved")
            .unwrap();
        assert_eq!(message, (1, sequence));
    }

    gate.cancel();
    bus.close_timeout(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_no_workers_left_after_close() {
    let bus = SubPub::<(usize, usize)>::new();

    let received: Received = Arc::default();
    let mut subscriptions = Vec::new();
    for subject in ["a", "b", "c"] {
        for _ in 0..10 {
            subscriptions.push(bus.subscribe(subject, recording_handler(&received)).unwrap());
        }
    }

    // Some unsubscribed before close, the rest torn down by close.
    for subscription in subscriptions.iter().step_by(3) {
        subscription.unsubscribe();
    }

    bus.publish("a", (0, 0)).unwrap();

    bus.close(CancellationToken::new()).await.unwrap();

    assert!(subscriptions.iter().all(|s| !s.is_active()));
    timeout(Duration::from_millis(100), bus.join())
        .await
        .expect("all workers should have exited");

    assert_eq!(bus.subscriber_count("a"), 0);
    assert!(matches!(bus.publish("a", (0, 1)), Err(Error::Closed)));
}

#[tokio::test]
async fn test_subscriber_only_sees_messages_after_subscribing() {
    let bus = SubPub::<(usize, usize)>::new();

    bus.publish("topic", (0, 0)).unwrap();

    let received: Received = Arc::default();
    bus.subscribe("topic", recording_handler(&received)).unwrap();

    bus.publish("topic", (0, 1)).unwrap();
    bus.close_timeout(Duration::from_secs(1)).await.unwrap();

    assert_eq!(*received.lock(), vec![(0, 1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nothing_delivered_after_unsubscribe_under_contention() {
    const ROUNDS: usize = 200;
    const MARKER: usize = usize::MAX;

    for round in 0..ROUNDS {
        let bus = SubPub::<(usize, usize)>::with_queue_capacity(2);
        let received: Received = Arc::default();
        let subscription = bus.subscribe("race", recording_handler(&received)).unwrap();
        let unsubscribed = Arc::new(AtomicBool::new(false));

        let publisher = {
            let bus = bus.clone();
            let unsubscribed = Arc::clone(&unsubscribed);
            tokio::spawn(async move {
                let mut sequence = 0;
                loop {
                    if unsubscribed.load(Ordering::Acquire) {
                        // Either dropped or rejected once the bus is closed.
                        let _ = bus.publish("race", (0, MARKER));
                        break;
                    }
                    if bus.publish("race", (0, sequence)).is_err() {
                        break;
                    }
                    sequence += 1;
                    if sequence % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        for _ in 0..round % 8 {
            tokio::task::yield_now().await;
        }

        subscription.unsubscribe();
        unsubscribed.store(true, Ordering::Release);

        let (closed, published) =
            tokio::join!(bus.close_timeout(Duration::from_secs(5)), publisher);
        closed.unwrap();
        published.unwrap();

        let received = received.lock();
        assert!(
            received.iter().all(|&(_, sequence)| sequence != MARKER),
            "round {round}: message published after unsubscribe was delivered"
        );
        let expected: Vec<_> = (0..received.len()).map(|sequence| (0, sequence)).collect();
        assert_eq!(*received, expected, "round {round}: delivery out of order");
    }
}
