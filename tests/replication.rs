//! Publisher/subscriber replication over real TCP connections.

use std::time::Duration;

use daq_master::protocol::Value;
use daq_master::sync_struct::{lock, Notifier, Publisher, Subscriber, PREAMBLE};
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_recipients(publisher: &Publisher, n: usize) {
    timeout(WAIT, async {
        while publisher.recipient_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("recipient count never reached");
}

#[tokio::test]
async fn test_subscriber_follows_mutations() {
    let notifier = Notifier::shared(Value::list());
    let mut publisher = Publisher::new(notifier.clone());
    let addr = publisher.start("127.0.0.1:0").await.unwrap();

    let subscriber = Subscriber::connect_value(addr).await.unwrap();
    timeout(WAIT, subscriber.wait_until(|v| v.as_list().is_some()))
        .await
        .unwrap()
        .unwrap();
    wait_for_recipients(&publisher, 1).await;

    {
        let mut n = lock(&notifier);
        n.append(Value::from(1)).unwrap();
        n.append(Value::from(2)).unwrap();
        n.insert(0, Value::from("first")).unwrap();
        n.remove_at(-1).unwrap();
    }

    let expected = Value::List(vec![Value::from("first"), Value::from(1)]);
    timeout(WAIT, subscriber.wait_until(|v| *v == expected))
        .await
        .unwrap()
        .unwrap();

    subscriber.close().await.unwrap();
    publisher.stop().await;
}

#[tokio::test]
async fn test_late_subscriber_gets_current_snapshot() {
    let notifier = Notifier::shared(Value::dict());
    {
        let mut n = lock(&notifier);
        n.insert("a", Value::from(1)).unwrap();
        n.insert("b", Value::from(2.5)).unwrap();
        n.remove_key("a").unwrap();
    }
    let mut publisher = Publisher::new(notifier.clone());
    let addr = publisher.start("127.0.0.1:0").await.unwrap();

    let subscriber = Subscriber::connect_value(addr).await.unwrap();
    let expected = Value::from_pairs([("b", Value::from(2.5))]);
    timeout(WAIT, subscriber.wait_until(|v| *v == expected))
        .await
        .unwrap()
        .unwrap();

    subscriber.close().await.unwrap();
    publisher.stop().await;
}

#[tokio::test]
async fn test_every_subscriber_converges() {
    let notifier = Notifier::shared(Value::dict());
    let mut publisher = Publisher::new(notifier.clone());
    let addr = publisher.start("127.0.0.1:0").await.unwrap();

    let subscribers: Vec<Subscriber<Value>> =
        join_all((0..4).map(|_| Subscriber::connect_value(addr)))
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
    wait_for_recipients(&publisher, 4).await;

    for i in 0..50 {
        lock(&notifier)
            .insert(format!("k{}", i % 7), Value::from(i))
            .unwrap();
    }

    let expected = lock(&notifier).read().clone();
    for subscriber in &subscribers {
        timeout(WAIT, subscriber.wait_until(|v| *v == expected))
            .await
            .unwrap()
            .unwrap();
    }

    for subscriber in subscribers {
        subscriber.close().await.unwrap();
    }
    publisher.stop().await;
    assert_eq!(publisher.recipient_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribers_joining_mid_stream_see_every_append_once() {
    const APPENDS: i64 = 5_000;

    let notifier = Notifier::shared(Value::list());
    let mut publisher = Publisher::new(notifier.clone());
    let addr = publisher.start("127.0.0.1:0").await.unwrap();

    let writer = {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            for i in 0..APPENDS {
                lock(&notifier).append(Value::from(i)).unwrap();
                if i % 50 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        })
    };

    // Handshakes race with the appends.
    let mut subscribers = Vec::new();
    for _ in 0..6 {
        subscribers.push(Subscriber::connect_value(addr).await.unwrap());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    writer.await.unwrap();

    let expected = Value::List((0..APPENDS).map(Value::from).collect());
    assert_eq!(lock(&notifier).read(), &expected);
    for subscriber in &subscribers {
        timeout(WAIT, subscriber.wait_until(|v| *v == expected))
            .await
            .unwrap()
            .unwrap();
    }

    for subscriber in subscribers {
        subscriber.close().await.unwrap();
    }
    publisher.stop().await;
}

#[tokio::test]
async fn test_bad_preamble_is_dropped() {
    let notifier = Notifier::shared(Value::list());
    let mut publisher = Publisher::new(notifier);
    let addr = publisher.start("127.0.0.1:0").await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let garbage = vec![b'x'; PREAMBLE.len()];
    stream.write_all(&garbage).await.unwrap();

    // Closed without a snapshot.
    let mut buf = Vec::new();
    let n = timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(publisher.recipient_count(), 0);
    publisher.stop().await;
}

#[tokio::test]
async fn test_stop_closes_subscribers() {
    let notifier = Notifier::shared(Value::list());
    let mut publisher = Publisher::new(notifier);
    let addr = publisher.start("127.0.0.1:0").await.unwrap();

    let subscriber = Subscriber::connect_value(addr).await.unwrap();
    timeout(WAIT, subscriber.wait_until(|_| true))
        .await
        .unwrap()
        .unwrap();
    publisher.stop().await;

    let closed = timeout(WAIT, subscriber.wait_until(|_| false)).await.unwrap();
    assert!(closed.is_err());
}
