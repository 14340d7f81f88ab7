//! Listener, player registry, and shutdown signal for one kurafuto edge.

use crate::auth;
use crate::config::Config;
use crate::player::Player;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// A running kurafuto edge: holds the configuration, the salt used for
/// name verification, the set of currently-connected players, and the
/// machinery needed to stop the accept loop from another task.
pub struct Server {
    pub config: Config,
    pub salt: String,
    players: Mutex<Vec<Arc<Player>>>,
    quitting: AtomicBool,
    shutdown: Notify,
}

impl Server {
    /// Binds the listening socket described by `config.address`/`config.port`.
    /// `salt` is either generated fresh or pinned via `--force-salt`.
    pub async fn bind(config: Config, salt: String) -> anyhow::Result<(Arc<Server>, TcpListener)> {
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let server = Arc::new(Server {
            config,
            salt,
            players: Mutex::new(Vec::new()),
            quitting: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        Ok((server, listener))
    }

    #[cfg(test)]
    pub fn new_for_test(config: Config, salt: String) -> Arc<Server> {
        Arc::new(Server {
            config,
            salt,
            players: Mutex::new(Vec::new()),
            quitting: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn player_count(&self) -> usize {
        self.players.lock().unwrap().len()
    }

    pub fn add_player(self: &Arc<Self>, player: Arc<Player>) {
        self.players.lock().unwrap().push(player);
    }

    pub fn remove_player(&self, player: &Arc<Player>) {
        self.players.lock().unwrap().retain(|p| !Arc::ptr_eq(p, player));
    }

    /// Accept loop: spawns a `Player::run` task per accepted connection.
    /// Returns once `quit()` is called (or the listener errors).
    pub async fn run(self: &Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    log::info!("kurafuto: shutting down accept loop");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let player = Player::new(self.clone());
                            log::info!("({}) connection from {addr}", player.id);
                            self.add_player(player.clone());
                            tokio::spawn(player.run(stream));
                        }
                        Err(e) => {
                            log::warn!("kurafuto: accept error: {e}");
                        }
                    }
                }
            }
        }

        // Kick every remaining player, collecting each one's grace-window
        // task so we don't return (and let the caller tear down the
        // runtime) before every `DisconnectPlayer` has had its chance to
        // reach the wire and every per-player task has been torn down. This
        // is the "done" signal from the data model: callers await `run()`
        // itself to know shutdown has fully drained.
        let stragglers: Vec<Arc<Player>> = self.players.lock().unwrap().clone();
        let mut grace_handles = Vec::with_capacity(stragglers.len());
        for player in stragglers {
            if let Some(handle) = player.kick("Server shutting down.") {
                grace_handles.push(handle);
            }
        }
        for handle in grace_handles {
            let _ = handle.await;
        }
        log::info!("kurafuto: all players drained, shutdown complete");
    }

    /// Signals the accept loop (if running) to stop. Idempotent.
    pub fn quit(&self) {
        if !self.quitting.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }
}

/// Picks the salt used for name-verification hashes: either a
/// caller-provided pin (`--force-salt`) or a freshly generated one.
pub fn resolve_salt(forced: Option<String>) -> String {
    forced.unwrap_or_else(auth::generate_salt)
}
