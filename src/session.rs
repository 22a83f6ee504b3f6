//! Presence tracking for signed-in users.
//!
//! A [`SessionTrackerHandle`] owns at most one open session and the
//! heartbeat task that keeps it marked online. The handle is created by
//! whoever owns the application lifecycle and must be stopped explicitly;
//! the server keeps one per user in a [`SessionRegistry`] and stops them all
//! on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{DeviceInfo, Location, SessionSink};
use crate::types::UserId;

#[derive(Debug)]
struct OpenSession {
    id: Uuid,
    stop: oneshot::Sender<()>,
    heartbeat: JoinHandle<()>,
}

#[derive(Debug)]
pub struct SessionTrackerHandle {
    sink: Arc<dyn SessionSink>,
    interval: Duration,
    open: Option<OpenSession>,
}

impl SessionTrackerHandle {
    pub fn new(sink: Arc<dyn SessionSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            open: None,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.open.as_ref().map(|s| s.id)
    }

    pub fn is_running(&self) -> bool {
        self.open.is_some()
    }

    /// Opens a session for `user` and starts its heartbeat. Returns the
    /// existing session id if one is already open.
    pub async fn start(&mut self, user: UserId, device: DeviceInfo, location: Location) -> Result<Uuid> {
        if let Some(open) = &self.open {
            return Ok(open.id);
        }

        let id = self
            .sink
            .open_session(user, &device, &location, Utc::now())
            .await?;
        let (stop, stopped) = oneshot::channel();
        let heartbeat = tokio::spawn(heartbeat(Arc::clone(&self.sink), id, self.interval, stopped));
        info!(%user, session = %id, "session tracking started");

        self.open = Some(OpenSession {
            id,
            stop,
            heartbeat,
        });
        Ok(id)
    }

    /// Cancels the heartbeat and marks the session offline. No-op when no
    /// session is open.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        // the task may already be gone; either way it no longer runs
        let _ = open.stop.send(());
        if let Err(e) = open.heartbeat.await {
            warn!(session = %open.id, error = %e, "heartbeat task ended abnormally");
        }
        self.sink.close_session(open.id, Utc::now()).await?;
        info!(session = %open.id, "session tracking stopped");
        Ok(())
    }
}

impl Drop for SessionTrackerHandle {
    fn drop(&mut self) {
        if let Some(open) = self.open.take() {
            open.heartbeat.abort();
        }
    }
}

async fn heartbeat(
    sink: Arc<dyn SessionSink>,
    session: Uuid,
    every: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately and the session was just opened
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                if let Err(e) = sink.touch_session(session, Utc::now()).await {
                    warn!(%session, error = %e, "session heartbeat failed");
                }
            }
        }
    }
}

/// The session handles of every signed-in user.
#[derive(Debug)]
pub struct SessionRegistry {
    sink: Arc<dyn SessionSink>,
    interval: Duration,
    handles: Mutex<HashMap<UserId, SessionTrackerHandle>>,
}

impl SessionRegistry {
    pub fn new(sink: Arc<dyn SessionSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, user: UserId, device: DeviceInfo, location: Location) -> Result<Uuid> {
        let mut handles = self.handles.lock().await;
        let handle = handles
            .entry(user)
            .or_insert_with(|| SessionTrackerHandle::new(Arc::clone(&self.sink), self.interval));
        handle.start(user, device, location).await
    }

    /// Stops the session of `user`. Returns whether one was open.
    pub async fn stop(&self, user: UserId) -> Result<bool> {
        let handle = self.handles.lock().await.remove(&user);
        match handle {
            Some(mut handle) => {
                let was_running = handle.is_running();
                handle.stop().await?;
                Ok(was_running)
            }
            None => Ok(false),
        }
    }

    /// Stops every open session, logging the ones that fail to close.
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain().collect();
        for (user, mut handle) in handles {
            if let Err(e) = handle.stop().await {
                warn!(%user, error = %e, "failed to close session on shutdown");
            }
        }
    }

    pub async fn open_count(&self) -> usize {
        self.handles
            .lock()
            .await
            .values()
            .filter(|h| h.is_running())
            .count()
    }
}
