//! Per-connection proxy pipeline: dial, identify, authenticate, splice,
//! disconnect.

use crate::auth;
use crate::hooks::{self, Direction};
use crate::packet::{self, Packet};
use crate::parser::{HookedParser, NextOutcome};
use crate::server::Server;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Read-idle timeout applied to both directions' `HookedParser`s.
const IDLE_TIMEOUT: Duration = Duration::from_secs(2);
/// Egress channel capacity (applies real backpressure to readers).
const EGRESS_CAPACITY: usize = 64;
/// Grace window after `Quit()` before egress channels and I/O tasks are
/// torn down, giving a just-enqueued `DisconnectPlayer` a chance to reach
/// the wire.
const QUIT_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Connecting,
    Identification,
    Idle,
    Disconnected,
}

#[derive(Default)]
struct PlayerFlags {
    quitting: bool,
    quit: bool,
}

struct IdentResult {
    name: String,
    cpe: bool,
}

/// A connected client, mid-splice to the hub. Owns both sockets (in split
/// halves, one per I/O task), both `HookedParser`s (inside their reader
/// tasks), and both egress channels.
pub struct Player {
    pub id: String,
    name: Mutex<Option<String>>,
    cpe: AtomicBool,
    state: Mutex<PlayerState>,
    flags: Mutex<PlayerFlags>,
    server: Arc<Server>,

    client_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    client_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    server_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    server_rx: Mutex<Option<mpsc::Receiver<Packet>>>,

    tasks: Mutex<Vec<AbortHandle>>,
}

/// A weak, cycle-safe reference to a `Player`, handed to hook closures so
/// they can't keep the `Player` alive by themselves (see DESIGN.md on
/// cyclic ownership).
#[derive(Clone)]
pub struct PlayerHandle(Weak<Player>);

impl PlayerHandle {
    /// A handle that never upgrades; used in unit tests that exercise hooks
    /// without a live `Player`.
    pub fn detached() -> Self {
        PlayerHandle(Weak::new())
    }

    pub fn id(&self) -> Option<String> {
        self.0.upgrade().map(|p| p.id.clone())
    }

    pub fn name(&self) -> Option<String> {
        self.0.upgrade().and_then(|p| p.name.lock().unwrap().clone())
    }

    /// Whether the underlying player identified as CPE-capable. `false` for
    /// a detached handle or one whose player hasn't identified yet.
    pub fn is_cpe(&self) -> bool {
        self.0.upgrade().is_some_and(|p| p.is_cpe())
    }

    /// Best-effort enqueue onto the client egress; silently dropped if the
    /// player is gone or already quitting.
    pub fn send_client(&self, packet: Packet) {
        if let Some(p) = self.0.upgrade() {
            p.send_client(packet);
        }
    }

    pub fn send_server(&self, packet: Packet) {
        if let Some(p) = self.0.upgrade() {
            p.send_server(packet);
        }
    }

    pub fn quit(&self) {
        if let Some(p) = self.0.upgrade() {
            p.quit();
        }
    }
}

impl Player {
    /// Allocates identifiers and egress channels. Does not dial yet.
    pub fn new(server: Arc<Server>) -> Arc<Player> {
        let (client_tx, client_rx) = mpsc::channel(EGRESS_CAPACITY);
        let (server_tx, server_rx) = mpsc::channel(EGRESS_CAPACITY);
        Arc::new(Player {
            id: auth::generate_player_id(),
            name: Mutex::new(None),
            cpe: AtomicBool::new(false),
            state: Mutex::new(PlayerState::Connecting),
            flags: Mutex::new(PlayerFlags::default()),
            server,
            client_tx: Mutex::new(Some(client_tx)),
            client_rx: Mutex::new(Some(client_rx)),
            server_tx: Mutex::new(Some(server_tx)),
            server_rx: Mutex::new(Some(server_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> PlayerHandle {
        PlayerHandle(Arc::downgrade(self))
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    pub fn is_cpe(&self) -> bool {
        self.cpe.load(Ordering::SeqCst)
    }

    /// Test-only: sets CPE status directly, bypassing the identification
    /// handshake, so hooks that branch on `PlayerHandle::is_cpe()` can be
    /// exercised without a live socket.
    #[cfg(test)]
    pub(crate) fn set_cpe_for_test(&self, cpe: bool) {
        self.cpe.store(cpe, Ordering::SeqCst);
    }

    pub fn state(&self) -> PlayerState {
        *self.state.lock().unwrap()
    }

    fn send_client(&self, packet: Packet) {
        if let Some(tx) = self.client_tx.lock().unwrap().clone() {
            let _ = tx.try_send(packet);
        }
    }

    fn send_server(&self, packet: Packet) {
        if let Some(tx) = self.server_tx.lock().unwrap().clone() {
            let _ = tx.try_send(packet);
        }
    }

    /// Enqueues a `DisconnectPlayer(reason)` to the client, then begins
    /// orderly shutdown. Returns the grace-window task's `JoinHandle` so a
    /// caller that needs the disconnect to have actually reached (or failed
    /// to reach) the wire before proceeding can await it; `None` if the
    /// player was already quitting.
    pub fn kick(self: &Arc<Self>, reason: impl Into<String>) -> Option<tokio::task::JoinHandle<()>> {
        self.send_client(Packet::new_disconnect_player(reason));
        self.quit()
    }

    /// Idempotent. The first call wins; later calls are no-ops and return
    /// `None`. Safe to call from any task, including from within a hook.
    /// The returned `JoinHandle` (on the winning call) completes once the
    /// grace window has elapsed and teardown (`finish_quit`) has run —
    /// awaiting it is how a caller observes this player fully drained.
    pub fn quit(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        {
            let mut flags = self.flags.lock().unwrap();
            if flags.quitting || flags.quit {
                return None;
            }
            flags.quitting = true;
        }
        *self.state.lock().unwrap() = PlayerState::Disconnected;
        self.server.remove_player(self);

        let player = self.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(QUIT_GRACE).await;
            player.finish_quit();
        }))
    }

    fn finish_quit(&self) {
        self.flags.lock().unwrap().quit = true;
        // Drop our own egress sender clones; combined with aborting the
        // tasks below (which drop theirs), this closes both channels.
        self.client_tx.lock().unwrap().take();
        self.server_tx.lock().unwrap().take();
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Runs the full connection state machine: dial, identify,
    /// authenticate, splice. Returns once the player is fully shut down.
    pub async fn run(self: Arc<Self>, client_stream: TcpStream) {
        let hub = match self.server.config.hub() {
            Ok(hub) => hub.clone(),
            Err(e) => {
                log::error!("({}) {e:#}", self.id);
                self.quit();
                return;
            }
        };

        let server_stream = match TcpStream::connect((hub.address.as_str(), hub.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!(
                    "({}) failed to dial hub {}:{}: {e}",
                    self.id,
                    hub.address,
                    hub.port
                );
                self.quit();
                return;
            }
        };

        *self.state.lock().unwrap() = PlayerState::Identification;

        let (client_read, client_write) = client_stream.into_split();
        let (server_read, server_write) = server_stream.into_split();

        let mut client_parser = HookedParser::new(client_read, Direction::ServerBound, IDLE_TIMEOUT);
        let mut server_parser = HookedParser::new(server_read, Direction::ClientBound, IDLE_TIMEOUT);

        {
            let srv = self.server.clone();
            client_parser.register(
                packet::ALL_PACKETS,
                Box::new(move |p, d, pk| hooks::trace_packet(&srv, p, d, pk)),
            );
            let srv = self.server.clone();
            client_parser.register(
                packet::ALL_PACKETS,
                Box::new(move |p, d, pk| hooks::drop_packet(&srv, p, d, pk)),
            );
            let srv = self.server.clone();
            server_parser.register(
                packet::ALL_PACKETS,
                Box::new(move |p, d, pk| hooks::trace_packet(&srv, p, d, pk)),
            );
            let srv = self.server.clone();
            server_parser.register(
                packet::ALL_PACKETS,
                Box::new(move |p, d, pk| hooks::drop_packet(&srv, p, d, pk)),
            );
            if self.server.config.edge_commands {
                let srv = self.server.clone();
                client_parser.register(
                    packet::ID_MESSAGE,
                    Box::new(move |p, d, pk| hooks::edge_command(&srv, p, d, pk)),
                );
            }
            client_parser.register(packet::ID_MESSAGE, Box::new(hooks::log_message));
            server_parser.register(packet::ID_MESSAGE, Box::new(hooks::log_message));
        }

        let handle = self.handle();
        let client_tx = self
            .client_tx
            .lock()
            .unwrap()
            .clone()
            .expect("client egress not yet closed during setup");
        let server_tx = self
            .server_tx
            .lock()
            .unwrap()
            .clone()
            .expect("server egress not yet closed during setup");

        // Client-write task starts immediately so a Kick() during
        // identification can actually reach the wire.
        let client_rx = self
            .client_rx
            .lock()
            .unwrap()
            .take()
            .expect("client egress receiver already taken");
        let cw_player = self.clone();
        let client_write_task =
            tokio::spawn(async move { writer_loop(&cw_player, client_rx, client_write).await });
        self.tasks.lock().unwrap().push(client_write_task.abort_handle());

        // Client-read task also starts immediately; its first action is
        // the identification handshake described below, after which it
        // falls through into the steady-state forwarding loop.
        let (ident_tx, ident_rx) = oneshot::channel();
        let cr_player = self.clone();
        let cr_handle = handle.clone();
        let cr_server_tx = server_tx.clone();
        let client_read_task = tokio::spawn(async move {
            client_reader_task(cr_player, client_parser, cr_handle, cr_server_tx, ident_tx).await
        });
        self.tasks.lock().unwrap().push(client_read_task.abort_handle());

        let ident = match ident_rx.await {
            Ok(Some(ident)) => ident,
            _ => return, // Kicked, quit, or a transport error; nothing more to do.
        };

        *self.name.lock().unwrap() = Some(ident.name.clone());
        self.cpe.store(ident.cpe, Ordering::SeqCst);
        *self.state.lock().unwrap() = PlayerState::Idle;
        log::info!(
            "({}) {} identified{}",
            self.id,
            ident.name,
            if ident.cpe { " [CPE]" } else { "" }
        );

        let server_rx = self
            .server_rx
            .lock()
            .unwrap()
            .take()
            .expect("server egress receiver already taken");
        let sw_player = self.clone();
        let server_write_task =
            tokio::spawn(async move { writer_loop(&sw_player, server_rx, server_write).await });
        self.tasks.lock().unwrap().push(server_write_task.abort_handle());

        let sr_player = self.clone();
        let sr_handle = handle.clone();
        let sr_client_tx = client_tx.clone();
        let server_read_task = tokio::spawn(async move {
            forward_loop(&sr_player, &mut server_parser, &sr_handle, &sr_client_tx).await;
            sr_player.quit();
        });
        self.tasks.lock().unwrap().push(server_read_task.abort_handle());
    }
}

/// The client-read task: performs the Identification handshake inline as
/// its first step (so only one task ever touches the client parser), then
/// falls through to the generic forwarding loop.
async fn client_reader_task(
    player: Arc<Player>,
    mut parser: HookedParser<OwnedReadHalf>,
    handle: PlayerHandle,
    server_tx: mpsc::Sender<Packet>,
    ident_tx: oneshot::Sender<Option<IdentResult>>,
) {
    let result = identify(&player, &mut parser, &handle, &server_tx).await;
    let identified = result.is_some();
    let _ = ident_tx.send(result);
    if !identified {
        return;
    }
    forward_loop(&player, &mut parser, &handle, &server_tx).await;
    player.quit();
}

async fn identify(
    player: &Arc<Player>,
    parser: &mut HookedParser<OwnedReadHalf>,
    handle: &PlayerHandle,
    server_tx: &mpsc::Sender<Packet>,
) -> Option<IdentResult> {
    match parser.next(handle).await {
        Ok(NextOutcome::Finished) => {
            player.kick("You need to log in!");
            None
        }
        Ok(NextOutcome::Skipped) => {
            log::debug!("({}) first packet was skipped by a hook; disconnecting", player.id);
            player.quit();
            None
        }
        Ok(NextOutcome::Packet(Packet::Identification {
            name,
            key_motd,
            user_type,
        })) => {
            let forwarded = Packet::Identification {
                name: name.clone(),
                key_motd: key_motd.clone(),
                user_type,
            };
            if server_tx.send(forwarded).await.is_err() {
                player.quit();
                return None;
            }
            if player.server.config.verify_names
                && !auth::compare_hash(&player.server.salt, &name, &key_motd)
            {
                player.kick("Name wasn't verified!");
                return None;
            }
            Some(IdentResult {
                name,
                cpe: user_type == packet::USER_TYPE_CPE,
            })
        }
        Ok(NextOutcome::Packet(other)) => {
            log::info!(
                "({}) expected Identification, got packet id {:#04x}; disconnecting",
                player.id,
                other.id()
            );
            player.quit();
            None
        }
        Err(e) => {
            log::debug!("({}) transport error awaiting identification: {e}", player.id);
            player.quit();
            None
        }
    }
}

/// Shared reader-loop body: decode, run hooks, forward. Used by both the
/// server-read task and (after identification) the client-read task.
async fn forward_loop(
    player: &Arc<Player>,
    parser: &mut HookedParser<OwnedReadHalf>,
    handle: &PlayerHandle,
    out_tx: &mpsc::Sender<Packet>,
) {
    loop {
        match parser.next(handle).await {
            Ok(NextOutcome::Finished) => break,
            Ok(NextOutcome::Skipped) => continue,
            Ok(NextOutcome::Packet(packet)) => {
                if out_tx.send(packet).await.is_err() {
                    player.quit();
                    break;
                }
            }
            Err(e) => {
                log::debug!("({}) transport error: {e}", player.id);
                player.quit();
                break;
            }
        }
    }
}

async fn writer_loop(player: &Arc<Player>, mut rx: mpsc::Receiver<Packet>, mut half: OwnedWriteHalf) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = packet::write_packet(&mut half, &packet).await {
            log::debug!("({}) write error: {e}", player.id);
            player.quit();
            return;
        }
    }
    player.quit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerEntry};

    fn test_server() -> Arc<Server> {
        let mut config = Config::default();
        config.servers.push(ServerEntry {
            name: "hub".to_string(),
            address: "127.0.0.1".to_string(),
            port: 0,
        });
        Server::new_for_test(config, "S".to_string())
    }

    #[tokio::test]
    async fn quit_is_idempotent() {
        let server = test_server();
        let player = Player::new(server.clone());
        server.add_player(player.clone());
        player.quit();
        player.quit();
        assert_eq!(player.state(), PlayerState::Disconnected);
        assert_eq!(server.player_count(), 0);
    }

    #[tokio::test]
    async fn quit_handle_resolves_once_grace_window_completes() {
        let server = test_server();
        let player = Player::new(server.clone());
        server.add_player(player.clone());

        let handle = player.quit().expect("first quit() call should spawn the grace task");
        handle.await.expect("grace task should not panic");

        // Second call is a no-op and returns None, matching the idempotent
        // contract; the first call's handle already observed full teardown.
        assert!(player.quit().is_none());
    }

    #[tokio::test]
    async fn detached_handle_methods_are_no_ops() {
        let handle = PlayerHandle::detached();
        assert_eq!(handle.name(), None);
        assert_eq!(handle.id(), None);
        handle.send_client(Packet::new_message(127, "hi"));
        handle.quit();
    }
}
