//! Heartbeat monitor: catches half-open links that never produce an I/O error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};
use wintree_core::wire;
use wintree_core::{NetworkCode, WindowId};

use crate::link::{closed, LinkError, LinkOwner, LinkSignal};

/// Liveness bookkeeping shared by a link's receive loop and its monitor.
#[derive(Debug)]
pub(crate) struct Health {
    alive: AtomicBool,
    last_keep_alive: Mutex<Instant>,
}

impl Health {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_keep_alive: Mutex::new(Instant::now()),
        }
    }

    /// A keep-alive (probe or reply) arrived.
    pub fn touch(&self) {
        *self
            .last_keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn mark_unconfirmed(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn last_keep_alive(&self) -> Instant {
        *self
            .last_keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One cycle per `period`: wait half, mark unconfirmed and probe, wait half, kill if nothing came back.
/// Ends when the link closes or after reporting a timeout; never reschedules past either.
pub(crate) async fn monitor<O: LinkOwner>(
    owner: Arc<O>,
    peer: WindowId,
    serial: u64,
    period: Duration,
    health: Arc<Health>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    mut signal: watch::Receiver<LinkSignal>,
) {
    let half = period / 2;
    loop {
        if !pause(half, &mut signal).await {
            return;
        }
        health.mark_unconfirmed();
        if outbound
            .send(wire::encode_code(NetworkCode::KeepAlive))
            .is_err()
        {
            return;
        }
        if !pause(half, &mut signal).await {
            return;
        }
        if !health.is_alive() {
            warn!(
                %peer,
                serial,
                silent_for = ?health.last_keep_alive().elapsed(),
                "keep-alive unanswered"
            );
            owner.on_link_failed(&peer, serial, LinkError::HeartbeatTimeout);
            return;
        }
        trace!(%peer, serial, "keep-alive confirmed");
    }
}

/// Sleep for `d`. False if the link closed first.
async fn pause(d: Duration, signal: &mut watch::Receiver<LinkSignal>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => true,
        _ = closed(signal) => false,
    }
}

#[cfg(test)]
mod tests {
    use wintree_core::{WindowInfo, WindowMessage};

    use super::*;

    #[derive(Default)]
    struct Failures(Mutex<Vec<String>>);

    impl LinkOwner for Failures {
        fn on_message(&self, _peer: &WindowInfo, _serial: u64, _msg: WindowMessage) {}

        fn on_link_failed(&self, _peer: &WindowId, _serial: u64, err: LinkError) {
            self.0.lock().unwrap().push(err.to_string());
        }
    }

    #[test]
    fn health_transitions() {
        let h = Health::new();
        assert!(h.is_alive());
        h.mark_unconfirmed();
        assert!(!h.is_alive());
        let before = h.last_keep_alive();
        h.touch();
        assert!(h.is_alive());
        assert!(h.last_keep_alive() >= before);
    }

    #[tokio::test]
    async fn unanswered_probe_fails_link() {
        let owner = Arc::new(Failures::default());
        let health = Arc::new(Health::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_signal, signal_rx) = watch::channel(LinkSignal::Open);
        let task = tokio::spawn(monitor(
            owner.clone(),
            WindowId::generate(),
            1,
            Duration::from_millis(100),
            health,
            tx,
            signal_rx,
        ));
        assert_eq!(rx.recv().await, Some(vec![NetworkCode::KeepAlive as u8]));
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            owner.0.lock().unwrap().as_slice(),
            &[LinkError::HeartbeatTimeout.to_string()]
        );
    }

    #[tokio::test]
    async fn answered_probes_keep_link_until_closed() {
        let owner = Arc::new(Failures::default());
        let health = Arc::new(Health::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (signal, signal_rx) = watch::channel(LinkSignal::Open);
        let task = tokio::spawn(monitor(
            owner.clone(),
            WindowId::generate(),
            1,
            Duration::from_millis(60),
            health.clone(),
            tx,
            signal_rx,
        ));
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
            health.touch();
        }
        signal.send_replace(LinkSignal::Abort);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(owner.0.lock().unwrap().is_empty());
    }
}
