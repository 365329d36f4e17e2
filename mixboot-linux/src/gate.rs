//! Connectivity gate: start the follower, then wait for a healthy report or give up at the deadline.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::session::{Network, NetworkError, Session};

/// Health values buffered between the follower and the gate.
pub const HEALTH_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("failed to start network follower: {0}")]
    FollowerStart(#[source] NetworkError),
    #[error("network not healthy after {0:?}")]
    Timeout(Duration),
}

/// Block until the session's network reports healthy, or fail after `wait_timeout`.
/// One-shot: the health subscription is dropped once the gate resolves.
pub async fn await_connectivity(
    session: &Session,
    follower_timeout: Duration,
    wait_timeout: Duration,
) -> Result<(), GateError> {
    await_network(session.network().as_ref(), follower_timeout, wait_timeout).await
}

pub async fn await_network(
    network: &dyn Network,
    follower_timeout: Duration,
    wait_timeout: Duration,
) -> Result<(), GateError> {
    let (tx, mut rx) = mpsc::channel(HEALTH_QUEUE_CAPACITY);
    // Subscribe before starting so the first transition cannot be missed.
    let callback = network.add_health_callback(Box::new(move |healthy| {
        if tx.try_send(healthy).is_err() {
            warn!(healthy, "health queue full, dropping value");
        }
    }));

    let result = async {
        network
            .start_follower(follower_timeout)
            .await
            .map_err(GateError::FollowerStart)?;
        info!(timeout = ?wait_timeout, "network follower started, waiting for health");
        await_first_of(&mut rx, wait_timeout).await
    }
    .await;

    network.remove_health_callback(callback);
    result
}

/// Race the health queue against a deadline. `true` wins immediately; `false` is logged and
/// the wait goes on; only the deadline ends it otherwise.
pub async fn await_first_of(rx: &mut mpsc::Receiver<bool>, timeout: Duration) -> Result<(), GateError> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            value = rx.recv() => match value {
                Some(true) => {
                    info!("Network Status: true");
                    return Ok(());
                }
                Some(false) => info!("Network Status: false"),
                None => {
                    // No producer left; nothing but the deadline can resolve the wait.
                    (&mut deadline).await;
                    return Err(GateError::Timeout(timeout));
                }
            },
            _ = &mut deadline => return Err(GateError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackNetwork;
    use tokio::time::Instant;

    const FOLLOWER: Duration = Duration::from_secs(5);
    const WAIT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn resolves_when_true_arrives_not_at_deadline() {
        let net = LoopbackNetwork::with_health(vec![(Duration::from_secs(4), true)]);
        let start = Instant::now();
        await_network(&net, FOLLOWER, WAIT).await.unwrap();
        let took = start.elapsed();
        assert!(took >= Duration::from_secs(4), "{:?}", took);
        assert!(took < Duration::from_secs(5), "{:?}", took);
    }

    #[tokio::test(start_paused = true)]
    async fn false_only_times_out_at_deadline() {
        let net = LoopbackNetwork::with_health(vec![
            (Duration::from_secs(1), false),
            (Duration::from_secs(2), false),
            (Duration::from_secs(20), false),
        ]);
        let start = Instant::now();
        let r = await_network(&net, FOLLOWER, WAIT).await;
        assert!(matches!(r, Err(GateError::Timeout(d)) if d == WAIT));
        assert!(start.elapsed() >= WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let net = LoopbackNetwork::default();
        let start = Instant::now();
        assert!(matches!(
            await_network(&net, FOLLOWER, WAIT).await,
            Err(GateError::Timeout(_))
        ));
        assert!(start.elapsed() >= WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn false_then_true_queued_resolves() {
        let (tx, mut rx) = mpsc::channel(HEALTH_QUEUE_CAPACITY);
        tx.try_send(false).unwrap();
        tx.try_send(true).unwrap();
        let start = Instant::now();
        await_first_of(&mut rx, WAIT).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_waits_for_deadline() {
        let (tx, mut rx) = mpsc::channel::<bool>(HEALTH_QUEUE_CAPACITY);
        drop(tx);
        let start = Instant::now();
        assert!(await_first_of(&mut rx, WAIT).await.is_err());
        assert!(start.elapsed() >= WAIT);
    }

    #[tokio::test]
    async fn follower_start_failure_is_reported() {
        let net = LoopbackNetwork::failing_start();
        assert!(matches!(
            await_network(&net, FOLLOWER, WAIT).await,
            Err(GateError::FollowerStart(_))
        ));
        assert_eq!(net.callback_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_dropped_after_resolve() {
        let net = LoopbackNetwork::with_health(vec![(Duration::from_millis(10), true)]);
        await_network(&net, FOLLOWER, WAIT).await.unwrap();
        assert_eq!(net.callback_count(), 0);
        assert!(net.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_beyond_capacity_does_not_block_notifier() {
        let net = LoopbackNetwork::default();
        let (tx, mut rx) = mpsc::channel(HEALTH_QUEUE_CAPACITY);
        let id = net.add_health_callback(Box::new(move |h| {
            let _ = tx.try_send(h);
        }));
        for _ in 0..(HEALTH_QUEUE_CAPACITY * 3) {
            net.emit_health(false);
        }
        net.remove_health_callback(id);
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, HEALTH_QUEUE_CAPACITY);
    }
}
