//! Supervision of the wireless uplink.
//!
//! The [`Supervisor`] is the only writer of [`UplinkState`]; everything else reads it through
//! [`Supervisor::subscribe`]. It joins the configured network once at [`Supervisor::begin`], falls
//! back to hosting an access point when that is impossible, and keeps the link alive from
//! [`Supervisor::run`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use strum_macros::{Display, EnumIter};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::credentials::{CredentialStore, Credentials};
use crate::error::{Error, Result};

/// Connectivity of the uplink, as seen by the rest of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum UplinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Hosting the setup access point until new credentials arrive.
    FallbackMode,
}

/// The radio (or whatever carries the uplink).
#[async_trait]
pub trait WirelessLink: Send + Sync {
    /// Start joining the network. Returns once the attempt is under way.
    async fn join(&self, credentials: &Credentials) -> Result<()>;

    /// Is the uplink usable right now?
    async fn is_connected(&self) -> bool;

    /// Host a local access point named `name`.
    async fn start_access_point(&self, name: &str) -> Result<()>;

    async fn leave(&self);
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub credentials_path: PathBuf,
    /// Bound on a single connection attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How often the link is asked whether it is up while connecting.
    #[serde(with = "humantime_serde")]
    pub status_poll: Duration,
    #[serde(with = "humantime_serde")]
    pub liveness_interval: Duration,
    /// Pause after losing the link (or failing to regain it) before the next attempt.
    #[serde(with = "humantime_serde")]
    pub retry_cooldown: Duration,
    pub access_point_name: String,
    /// Address whose reachability counts as "connected" on a host.
    pub probe_address: String,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("wifi_credentials.txt"),
            connect_timeout: Duration::from_secs(20),
            status_poll: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(10),
            retry_cooldown: Duration::from_secs(30),
            access_point_name: "psu-bridge-setup".to_string(),
            probe_address: "1.1.1.1:53".to_string(),
        }
    }
}

pub struct Supervisor {
    link: Arc<dyn WirelessLink>,
    store: CredentialStore,
    credentials: Mutex<Option<Credentials>>,
    state: watch::Sender<UplinkState>,
    restart: Notify,
    config: UplinkConfig,
}

impl Supervisor {
    pub fn new(link: Arc<dyn WirelessLink>, config: UplinkConfig) -> Arc<Self> {
        let (state, _) = watch::channel(UplinkState::Disconnected);
        Arc::new(Self {
            link,
            store: CredentialStore::new(config.credentials_path.clone()),
            credentials: Mutex::new(None),
            state,
            restart: Notify::new(),
            config,
        })
    }

    /// Load the stored credentials and make the first connection attempt.
    ///
    /// Ends in [`UplinkState::Connected`] or [`UplinkState::FallbackMode`]; an unreadable
    /// credentials file counts as no credentials.
    pub async fn begin(&self) -> UplinkState {
        let stored = self.store.load().unwrap_or_else(|err| {
            warn!(path = %self.store.path().display(), %err, "could not read credentials");
            None
        });
        *self.credentials() = stored;
        self.connect(UplinkState::FallbackMode).await
    }

    /// Replace the credentials in memory. Use [`Supervisor::save_credentials`] to keep them.
    pub fn set_credentials(&self, network_name: &str, secret: &str) {
        *self.credentials() = Some(Credentials::new(network_name, secret));
    }

    /// Persist the current credentials. In fallback mode this also restarts the connection
    /// attempt with them.
    pub fn save_credentials(&self) -> Result<()> {
        let credentials = self
            .credentials()
            .clone()
            .ok_or_else(|| Error::Config("no credentials to save".to_string()))?;
        self.store.save(&credentials)?;
        if self.current_state() == UplinkState::FallbackMode {
            self.restart.notify_one();
        }
        Ok(())
    }

    /// Forget the credentials, on disk and in memory, and fall back to the access point.
    ///
    /// The keep-alive loop picks up the new state on its next wake-up and then waits in fallback
    /// mode for new credentials.
    pub async fn clear_credentials(&self) -> Result<()> {
        self.store.clear()?;
        *self.credentials() = None;
        if self.current_state() != UplinkState::FallbackMode {
            self.link.leave().await;
            self.enter_fallback().await;
        }
        Ok(())
    }

    pub fn current_state(&self) -> UplinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UplinkState> {
        self.state.subscribe()
    }

    /// Keep the uplink alive for as long as the process runs.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.current_state() {
                UplinkState::Connected => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.liveness_interval) => {
                            if self.current_state() == UplinkState::Connected
                                && !self.link.is_connected().await
                            {
                                warn!("uplink lost");
                                self.set_state(UplinkState::Disconnected);
                            }
                        }
                        _ = self.restart.notified() => {}
                    }
                }
                UplinkState::Disconnected => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_cooldown) => {
                            if self.current_state() == UplinkState::Disconnected {
                                self.connect(UplinkState::Disconnected).await;
                            }
                        }
                        _ = self.restart.notified() => {}
                    }
                }
                UplinkState::FallbackMode => {
                    self.restart.notified().await;
                    if self.current_state() == UplinkState::FallbackMode {
                        self.connect(UplinkState::FallbackMode).await;
                    }
                }
                // Only connect() sets it, and connect() always leaves it.
                UplinkState::Connecting => tokio::time::sleep(self.config.status_poll).await,
            }
        }
    }

    /// One bounded connection attempt. `on_failure` is the state to settle in if it fails.
    async fn connect(&self, on_failure: UplinkState) -> UplinkState {
        let stored = self.credentials().clone();
        let credentials = match stored {
            Some(credentials) if credentials.is_complete() => credentials,
            _ => {
                info!("no usable credentials");
                return self.enter_fallback().await;
            }
        };

        self.set_state(UplinkState::Connecting);
        info!(network = %credentials.network_name, "joining uplink");
        if let Err(err) = self.link.join(&credentials).await {
            warn!(%err, "join failed");
            return self.fail(on_failure).await;
        }

        let poll = self.config.status_poll;
        let joined = tokio::time::timeout(self.config.connect_timeout, async {
            while !self.link.is_connected().await {
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        match joined {
            Ok(()) => {
                self.set_state(UplinkState::Connected);
                UplinkState::Connected
            }
            Err(_) => {
                warn!(timeout = ?self.config.connect_timeout, "uplink did not come up");
                self.link.leave().await;
                self.fail(on_failure).await
            }
        }
    }

    async fn fail(&self, on_failure: UplinkState) -> UplinkState {
        if on_failure == UplinkState::FallbackMode {
            self.enter_fallback().await
        } else {
            self.set_state(on_failure);
            on_failure
        }
    }

    async fn enter_fallback(&self) -> UplinkState {
        if let Err(err) = self
            .link
            .start_access_point(&self.config.access_point_name)
            .await
        {
            warn!(%err, "could not start access point");
        }
        self.set_state(UplinkState::FallbackMode);
        UplinkState::FallbackMode
    }

    fn set_state(&self, state: UplinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(%previous, %state, "uplink state changed");
        }
    }

    fn credentials(&self) -> MutexGuard<'_, Option<Credentials>> {
        self.credentials.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use strum::IntoEnumIterator;
    use tempfile::TempDir;

    /// A radio that comes up after a join only while `accepting` is set.
    #[derive(Default)]
    struct FakeLink {
        accepting: AtomicBool,
        connected: AtomicBool,
        joins: AtomicUsize,
        access_points: AtomicUsize,
    }

    impl FakeLink {
        fn accepting() -> Arc<Self> {
            let link = Self::default();
            link.accepting.store(true, Ordering::SeqCst);
            Arc::new(link)
        }

        fn drop_link(&self) {
            self.accepting.store(false, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }

        fn restore_link(&self) {
            self.accepting.store(true, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WirelessLink for FakeLink {
        async fn join(&self, _credentials: &Credentials) -> Result<()> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            let up = self.accepting.load(Ordering::SeqCst);
            self.connected.store(up, Ordering::SeqCst);
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn start_access_point(&self, _name: &str) -> Result<()> {
            self.access_points.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn leave(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    fn supervisor(dir: &TempDir, link: Arc<FakeLink>) -> Arc<Supervisor> {
        let config = UplinkConfig {
            credentials_path: dir.path().join("wifi_credentials.txt"),
            ..UplinkConfig::default()
        };
        Supervisor::new(link, config)
    }

    fn store_credentials(dir: &TempDir) {
        CredentialStore::new(dir.path().join("wifi_credentials.txt"))
            .save(&Credentials::new("lab", "hunter22"))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn valid_credentials_connect() {
        let dir = TempDir::new().unwrap();
        store_credentials(&dir);
        let link = FakeLink::accepting();
        let supervisor = supervisor(&dir, link.clone());
        assert_eq!(supervisor.current_state(), UplinkState::Disconnected);

        assert_eq!(supervisor.begin().await, UplinkState::Connected);
        assert_eq!(supervisor.current_state(), UplinkState::Connected);
        assert_eq!(link.joins.load(Ordering::SeqCst), 1);
        assert_eq!(link.access_points.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_credentials_fall_back_without_retrying() {
        let dir = TempDir::new().unwrap();
        let link = FakeLink::accepting();
        let supervisor = supervisor(&dir, link.clone());

        assert_eq!(supervisor.begin().await, UplinkState::FallbackMode);
        tokio::spawn(supervisor.clone().run());
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(supervisor.current_state(), UplinkState::FallbackMode);
        assert_eq!(link.joins.load(Ordering::SeqCst), 0);
        assert_eq!(link.access_points.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_time_out_into_fallback() {
        let dir = TempDir::new().unwrap();
        store_credentials(&dir);
        let link = Arc::new(FakeLink::default());
        let supervisor = supervisor(&dir, link.clone());

        let started = tokio::time::Instant::now();
        assert_eq!(supervisor.begin().await, UplinkState::FallbackMode);
        assert!(started.elapsed() >= Duration::from_secs(20));

        tokio::spawn(supervisor.clone().run());
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(link.joins.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.current_state(), UplinkState::FallbackMode);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_is_retried_after_cooldown() {
        let dir = TempDir::new().unwrap();
        store_credentials(&dir);
        let link = FakeLink::accepting();
        let supervisor = supervisor(&dir, link.clone());
        supervisor.begin().await;
        tokio::spawn(supervisor.clone().run());

        link.drop_link();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(supervisor.current_state(), UplinkState::Disconnected);

        // Liveness check at 10s, cool-down until 40s.
        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(supervisor.current_state(), UplinkState::Disconnected);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(supervisor.current_state(), UplinkState::Connecting);
        assert_eq!(link.joins.load(Ordering::SeqCst), 2);

        link.restore_link();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(supervisor.current_state(), UplinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_goes_back_to_disconnected() {
        let dir = TempDir::new().unwrap();
        store_credentials(&dir);
        let link = FakeLink::accepting();
        let supervisor = supervisor(&dir, link.clone());
        supervisor.begin().await;
        tokio::spawn(supervisor.clone().run());

        link.drop_link();
        // Lost at 10s, retry at 40s gives up at 60s.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(supervisor.current_state(), UplinkState::Disconnected);
        assert_eq!(link.access_points.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saving_credentials_in_fallback_restarts_the_attempt() {
        let dir = TempDir::new().unwrap();
        let link = FakeLink::accepting();
        let supervisor = supervisor(&dir, link.clone());
        supervisor.begin().await;
        tokio::spawn(supervisor.clone().run());

        supervisor.set_credentials("lab", "hunter22");
        supervisor.save_credentials().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(supervisor.current_state(), UplinkState::Connected);
        let stored = CredentialStore::new(dir.path().join("wifi_credentials.txt"))
            .load()
            .unwrap();
        assert_eq!(stored, Some(Credentials::new("lab", "hunter22")));
    }

    #[tokio::test]
    async fn saving_without_credentials_fails() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir, FakeLink::accepting());
        assert!(matches!(supervisor.save_credentials(), Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_forces_fallback_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        store_credentials(&dir);
        let link = FakeLink::accepting();
        let supervisor = supervisor(&dir, link.clone());
        supervisor.begin().await;
        tokio::spawn(supervisor.clone().run());
        let mut states = supervisor.subscribe();

        supervisor.clear_credentials().await.unwrap();
        assert_eq!(*states.borrow_and_update(), UplinkState::FallbackMode);
        assert!(!link.connected.load(Ordering::SeqCst));
        assert_eq!(link.access_points.load(Ordering::SeqCst), 1);

        // The loop settles in fallback mode without bringing the access point up again.
        tokio::time::sleep(Duration::from_secs(300)).await;
        supervisor.clear_credentials().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(supervisor.current_state(), UplinkState::FallbackMode);
        assert_eq!(link.access_points.load(Ordering::SeqCst), 1);
        assert_eq!(link.joins.load(Ordering::SeqCst), 1);
        assert!(!CredentialStore::new(dir.path().join("wifi_credentials.txt"))
            .path()
            .exists());
    }

    #[test]
    fn states_display_by_name() {
        let names: Vec<String> = UplinkState::iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            ["Disconnected", "Connecting", "Connected", "FallbackMode"]
        );
    }
}
