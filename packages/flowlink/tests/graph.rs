//! Integration tests for wiring sources and sinks into graphs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use flowlink::{Error, FanOutPolicy, Forwarder, Result, Sender, Sink, Source, WaitSignal};
use futures::executor::block_on;
use futures::future::BoxFuture;
use testing::{Recorder, with_watchdog};

/// A sink that logs everything posted to it.
#[derive(Debug, Default)]
struct Log<T>(Recorder<T>);

impl<T> Sink<T> for Log<T>
where
    T: Send + Sync,
{
    fn post(&self, message: T) -> Result<()> {
        self.0.record(message);
        Ok(())
    }

    fn post_async(&self, message: T) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0.record(message);
            Ok(())
        })
    }
}

/// A sink that rejects every message.
#[derive(Debug)]
struct Broken;

impl Sink<u32> for Broken {
    fn post(&self, message: u32) -> Result<()> {
        Err(Error::sink_failed(format!("cannot take {message}")))
    }

    fn post_async(&self, message: u32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.post(message) })
    }
}

/// A sink that lets the test hold a post in flight until released.
#[derive(Debug, Default)]
struct Gate {
    entered: WaitSignal,
    release: WaitSignal,
}

impl Sink<u32> for Gate {
    fn post(&self, _message: u32) -> Result<()> {
        self.entered.set();
        self.release.wait();
        Ok(())
    }

    fn post_async(&self, _message: u32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.entered.set();
            self.release.wait_future().await;
            Ok(())
        })
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn fan_out_tree_delivers_to_every_leaf() {
    with_watchdog(|| {
        let sender = Sender::<u32>::new();
        let left = sender.connect_to(&Arc::new(Forwarder::<u32>::new()));
        let right = sender.connect_to(&Arc::new(Forwarder::<u32>::new()));

        let leaves: Vec<Arc<Log<u32>>> = (0..4).map(|_| Arc::new(Log::default())).collect();
        left.connect_to(&leaves[0]);
        left.connect_to(&leaves[1]);
        right.connect_to(&leaves[2]);
        right.connect_to(&leaves[3]);

        for value in 0..10 {
            sender.send(value).unwrap();
        }

        for leaf in &leaves {
            assert_eq!(leaf.0.values(), (0..10).collect::<Vec<_>>());
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn weak_connection_does_not_keep_sink_alive() {
    with_watchdog(|| {
        let sender = Sender::<u32>::new();
        let log = sender.connect_weak_to(&Arc::new(Log::default()));

        sender.send(1).unwrap();
        assert_eq!(log.0.values(), vec![1]);
        assert_eq!(sender.count_connected_sinks(), 1);

        drop(log);

        assert_eq!(sender.count_connected_sinks(), 0);
        assert!(sender.connected_sinks().is_empty());
        sender.send(2).unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn best_effort_reports_failure_after_delivering_everywhere() {
    with_watchdog(|| {
        let sender = Sender::<u32>::new();
        sender.connect_to(&Arc::new(Broken));
        let log = sender.connect_to(&Arc::new(Log::default()));

        let error = sender.send(1).unwrap_err();

        assert!(matches!(
            error,
            Error::FanOut {
                failed: 1,
                attempted: 2,
                ..
            }
        ));
        assert_eq!(log.0.values(), vec![1]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn fail_fast_propagates_through_forwarders() {
    with_watchdog(|| {
        let sender = Sender::<u32>::with_policy(FanOutPolicy::FailFast);
        let forwarder = sender.connect_to(&Arc::new(Forwarder::<u32>::with_policy(
            FanOutPolicy::FailFast,
        )));
        forwarder.connect_to(&Arc::new(Broken));
        let log = forwarder.connect_to(&Arc::new(Log::default()));

        let error = block_on(sender.send_async(1)).unwrap_err();

        assert!(matches!(error, Error::SinkFailed { .. }));
        assert!(log.0.is_empty());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn disconnect_while_post_in_flight_affects_later_posts_only() {
    with_watchdog(|| {
        let sender = Arc::new(Sender::<u32>::new());
        let gate = sender.connect_to(&Arc::new(Gate::default()));
        let log = sender.connect_to(&Arc::new(Log::default()));

        thread::scope(|s| {
            let in_flight = s.spawn(|| sender.send(1).unwrap());

            gate.entered.wait();
            sender.disconnect_from(&log);
            gate.release.set();

            in_flight.join().unwrap();
        });

        // The in-flight post had already taken its snapshot, so the log still got it.
        assert_eq!(log.0.values(), vec![1]);

        sender.send(2).unwrap();
        assert_eq!(log.0.values(), vec![1]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn concurrent_connects_and_posts() {
    with_watchdog(|| {
        let sender = Arc::new(Sender::<u32>::new());
        let log = Arc::new(Log::default());
        let stop = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    sender.connect_to(&log);
                    sender.disconnect_from(&log);
                }
                stop.store(true, Ordering::Release);
            });

            s.spawn(|| {
                let mut value = 0;
                while !stop.load(Ordering::Acquire) {
                    sender.send(value).unwrap();
                    value += 1;
                }
            });
        });

        assert_eq!(sender.count_connected_sinks(), 0);

        // Whatever got through arrived in order.
        assert!(log.0.values().is_sorted());
    });
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn async_fan_out_awaits_each_sink_in_turn() {
    let sender = Sender::<u32>::new();
    let gate = sender.connect_to(&Arc::new(Gate::default()));
    let log = sender.connect_to(&Arc::new(Log::default()));

    let sender = Arc::new(sender);
    let post = tokio::spawn({
        let sender = Arc::clone(&sender);
        async move { sender.send_async(5).await }
    });

    assert!(gate.entered.wait_async(Some(Duration::from_secs(5)), None).await);
    assert!(log.0.is_empty());

    gate.release.set();
    post.await.unwrap().unwrap();

    assert_eq!(log.0.values(), vec![5]);
}
