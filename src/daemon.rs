//! Periodic background tasks.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::{sync::watch, task::JoinHandle, time::sleep};

/// Sender half used to stop every loop spawned with its receivers.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// `interval` stretched by a random fraction of up to `jitter`.
pub fn jittered(interval: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return interval;
    }
    interval.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..jitter))
}

/// Run `tick` every `interval` (plus jitter) until `shutdown` flips to true
/// or its sender is dropped. A tick is never started while the previous one
/// is still running.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    jitter: f64,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::debug!(task = name, ?interval, "background loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep(jittered(interval, jitter)) => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(task = name, "background loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(100);
        assert_eq!(jittered(base, 0.0), base);
        for _ in 0..100 {
            let d = jittered(base, 0.2);
            assert!(d >= base && d <= Duration::from_millis(120));
        }
    }

    #[tokio::test]
    async fn loop_ticks_until_shutdown() {
        let (tx, rx) = shutdown_channel();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_periodic("test", Duration::from_millis(5), 0.0, rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {seen} ticks");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
