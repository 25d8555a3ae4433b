//! Backing pod liveness.
//!
//! Uses the transport's push notifications when it offers them and falls
//! back to polling `get_pod` otherwise (or once the push channel closes).
//! A pod counts as gone when it is deleted, starts terminating, reaches a
//! terminal phase, or is replaced by a new instance under the same name.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::domain::{BackingPod, PodInfo, PodLifecycleEvent};
use crate::ports::ClusterTransport;

/// The watched pod instance is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodGone {
    pub reason: String,
}

/// Watches one pod instance until it goes away.
pub struct LivenessWatch<T> {
    transport: Arc<T>,
    namespace: String,
    pod: BackingPod,
    poll_interval: Duration,
    events: Option<mpsc::Receiver<PodLifecycleEvent>>,
    subscribed: bool,
}

impl<T: ClusterTransport> LivenessWatch<T> {
    pub fn new(
        transport: Arc<T>,
        namespace: impl Into<String>,
        pod: BackingPod,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
            pod,
            poll_interval,
            events: None,
            subscribed: false,
        }
    }

    /// Resolves once the pod is gone. Cancel safe.
    pub async fn gone(&mut self) -> PodGone {
        if !self.subscribed {
            match self.transport.watch_pod(&self.namespace, &self.pod).await {
                Ok(events) => self.events = events,
                Err(e) => {
                    debug!(pod = %self.pod.pod_name, error = %e, "Pod watch unavailable, polling instead");
                }
            }
            self.subscribed = true;
        }

        if let Some(events) = self.events.as_mut() {
            while let Some(event) = events.recv().await {
                if event.uid() != self.pod.pod_uid {
                    continue;
                }
                if let Some(reason) = lifecycle_gone(&self.pod, &event) {
                    return PodGone { reason };
                }
            }
            debug!(pod = %self.pod.pod_name, "Pod watch closed, polling instead");
            self.events = None;
        }

        self.poll().await
    }

    async fn poll(&self) -> PodGone {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match self
                .transport
                .get_pod(&self.namespace, &self.pod.pod_name)
                .await
            {
                Ok(None) => {
                    return PodGone {
                        reason: format!("pod {} was deleted", self.pod.pod_name),
                    }
                }
                Ok(Some(current)) => {
                    if let Some(reason) = snapshot_gone(&self.pod, &current) {
                        return PodGone { reason };
                    }
                }
                Err(e) => {
                    // The stream itself reports real connectivity loss.
                    debug!(pod = %self.pod.pod_name, error = %e, "Liveness poll failed");
                }
            }
        }
    }
}

fn lifecycle_gone(pod: &BackingPod, event: &PodLifecycleEvent) -> Option<String> {
    match event {
        PodLifecycleEvent::Deleted { .. } => Some(format!("pod {} was deleted", pod.pod_name)),
        PodLifecycleEvent::Terminating { .. } => {
            Some(format!("pod {} is terminating", pod.pod_name))
        }
        PodLifecycleEvent::PhaseChanged { phase, .. } if phase.is_terminal() => Some(format!(
            "pod {} entered phase {:?}",
            pod.pod_name, phase
        )),
        PodLifecycleEvent::PhaseChanged { .. } => None,
    }
}

fn snapshot_gone(pod: &BackingPod, current: &PodInfo) -> Option<String> {
    if current.uid != pod.pod_uid {
        Some(format!("pod {} was replaced", pod.pod_name))
    } else if current.terminating {
        Some(format!("pod {} is terminating", pod.pod_name))
    } else if current.phase.is_terminal() {
        Some(format!(
            "pod {} entered phase {:?}",
            pod.pod_name, current.phase
        ))
    } else {
        None
    }
}
