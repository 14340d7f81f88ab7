//! Hook registry and built-in hooks run by a `HookedParser`.

use crate::packet::{ALL_PACKETS, Packet};
use crate::player::PlayerHandle;
use crate::server::Server;
use rand::Rng;
use std::collections::HashMap;

/// Which direction a packet is travelling: from the client towards the hub
/// ("server-bound"), or from the hub towards the client ("client-bound").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ServerBound,
    ClientBound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ServerBound => write!(f, "C->S"),
            Direction::ClientBound => write!(f, "S->C"),
        }
    }
}

/// A hook function: returns `true` if it "handled" the packet, meaning the
/// `HookedParser` should not forward it and should signal `Skipped`.
pub type Hook = Box<dyn Fn(&PlayerHandle, Direction, &Packet) -> bool + Send + Sync>;

struct HookEntry {
    id: String,
    f: Hook,
}

fn new_hook_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Per-direction ordered map of packet-id -> registered hooks, plus a
/// dedicated wildcard bucket (rather than folding it into the id map under
/// the `0xFF` sentinel, which the original implementation did).
pub struct HookRegistry {
    wildcard: Vec<HookEntry>,
    by_id: HashMap<u8, Vec<HookEntry>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry {
            wildcard: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Registers `f` against `packet_id` (use `packet::ALL_PACKETS` for the
    /// wildcard bucket). Returns the new hook's id, for later `unregister`.
    pub fn register(&mut self, packet_id: u8, f: Hook) -> String {
        let id = new_hook_id();
        let entry = HookEntry { id: id.clone(), f };
        if packet_id == ALL_PACKETS {
            self.wildcard.push(entry);
        } else {
            self.by_id.entry(packet_id).or_default().push(entry);
        }
        id
    }

    /// Removes the first hook with a matching id. Returns whether anything
    /// was removed.
    pub fn unregister(&mut self, hook_id: &str) -> bool {
        if let Some(pos) = self.wildcard.iter().position(|e| e.id == hook_id) {
            self.wildcard.remove(pos);
            return true;
        }
        for hooks in self.by_id.values_mut() {
            if let Some(pos) = hooks.iter().position(|e| e.id == hook_id) {
                hooks.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn unregister_all(&mut self) {
        self.wildcard.clear();
        self.by_id.clear();
    }

    /// Runs the wildcard bucket (in registration order), then the
    /// packet-specific bucket. Short-circuits as soon as any hook returns
    /// `true`.
    pub fn dispatch(&self, player: &PlayerHandle, dir: Direction, packet: &Packet) -> bool {
        for entry in &self.wildcard {
            if (entry.f)(player, dir, packet) {
                return true;
            }
        }
        if let Some(hooks) = self.by_id.get(&packet.id()) {
            for entry in hooks {
                if (entry.f)(player, dir, packet) {
                    return true;
                }
            }
        }
        false
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Debug-logs every packet crossing the proxy, except ids in the
/// configured ignore-packets set. Never handles a packet; this only
/// suppresses logging, not forwarding.
pub fn trace_packet(server: &Server, _player: &PlayerHandle, dir: Direction, packet: &Packet) -> bool {
    if !server.config.ignore_packets.contains(&packet.id()) {
        log::debug!("{dir} packet {:#04x} ({} bytes)", packet.id(), packet.size());
    }
    false
}

/// Drops packets whose id is in the configured drop-id set, or which
/// advertise a CPE extension name in the configured drop-extension set.
pub fn drop_packet(server: &Server, _player: &PlayerHandle, dir: Direction, packet: &Packet) -> bool {
    if server.config.drop_packets.contains(&packet.id()) {
        log::debug!("dropping packet {:#04x} ({dir})", packet.id());
        return true;
    }
    if let Some(name) = packet.extension_name() {
        if server.config.drop_extensions.contains(name) {
            log::debug!("dropping extension packet '{name}' ({dir})");
            return true;
        }
    }
    false
}

/// Intercepts `:kura ...` chat commands sent by the client, replying on the
/// client egress and never forwarding the original message upstream.
pub fn edge_command(server: &Server, player: &PlayerHandle, dir: Direction, packet: &Packet) -> bool {
    if dir != Direction::ServerBound || !server.config.edge_commands {
        return false;
    }
    let Packet::Message { message, .. } = packet else {
        return false;
    };
    let mut tokens = message.split(' ').filter(|t| !t.is_empty());
    if tokens.next() != Some(":kura") {
        return false;
    }

    let reply = match tokens.next() {
        Some("list") => {
            let names: Vec<&str> = server.config.servers.iter().map(|s| s.name.as_str()).collect();
            format!("&eServers:&r {}", names.join(", "))
        }
        Some("info") => format!("&e{} player(s) online.", server.player_count()),
        Some("help") | _ => {
            "&e:kura commands: list, info, help".to_string()
        }
    };

    player.send_client(Packet::new_message(127, reply));
    true
}

/// Logs chat messages (server-bound and client-bound), colorified. Never
/// handles a packet.
pub fn log_message(player: &PlayerHandle, dir: Direction, packet: &Packet) -> bool {
    let Packet::Message { message, .. } = packet else {
        return false;
    };
    let name = player.name().unwrap_or_else(|| "?".to_string());
    let cpe_tag = if player.is_cpe() { "&3[CPE]&r " } else { "" };
    let line = match dir {
        Direction::ServerBound => format!("{cpe_tag}&f<{name}>&r {message}"),
        Direction::ClientBound => format!("&6[SERVER]&r {message}"),
    };
    log::info!("{}", crate::color::colorify(&line));
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn msg_packet() -> Packet {
        Packet::new_message(1, "hi")
    }

    #[test]
    fn wildcard_runs_before_specific_and_short_circuits() {
        let mut registry = HookRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order_w = order.clone();
        registry.register(
            ALL_PACKETS,
            Box::new(move |_p, _d, _pk| {
                order_w.lock().unwrap().push("wildcard");
                true
            }),
        );
        let order_s = order.clone();
        registry.register(
            crate::packet::ID_MESSAGE,
            Box::new(move |_p, _d, _pk| {
                order_s.lock().unwrap().push("specific");
                true
            }),
        );

        let handled = registry.dispatch(&PlayerHandle::detached(), Direction::ServerBound, &msg_packet());
        assert!(handled);
        assert_eq!(*order.lock().unwrap(), vec!["wildcard"]);
    }

    #[test]
    fn registration_order_is_preserved_within_a_bucket() {
        let mut registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let first_saw = Arc::new(AtomicUsize::new(0));

        let calls1 = calls.clone();
        let first1 = first_saw.clone();
        registry.register(
            crate::packet::ID_MESSAGE,
            Box::new(move |_p, _d, _pk| {
                first1.store(calls1.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
                false
            }),
        );
        let calls2 = calls.clone();
        registry.register(
            crate::packet::ID_MESSAGE,
            Box::new(move |_p, _d, _pk| {
                calls2.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );

        registry.dispatch(&PlayerHandle::detached(), Direction::ServerBound, &msg_packet());
        assert_eq!(first_saw.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregister_removes_exactly_one_entry() {
        let mut registry = HookRegistry::new();
        let id1 = registry.register(crate::packet::ID_MESSAGE, Box::new(|_, _, _| false));
        let _id2 = registry.register(crate::packet::ID_MESSAGE, Box::new(|_, _, _| false));

        assert!(registry.unregister(&id1));
        assert!(!registry.unregister(&id1));
        assert_eq!(registry.by_id.get(&crate::packet::ID_MESSAGE).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn log_message_tags_cpe_players() {
        let mut config = crate::config::Config::default();
        config.servers.push(crate::config::ServerEntry {
            name: "hub".to_string(),
            address: "127.0.0.1".to_string(),
            port: 0,
        });
        let server = Server::new_for_test(config, "salt".to_string());
        let player = crate::player::Player::new(server);
        player.set_cpe_for_test(true);
        let handle = player.handle();

        assert!(handle.is_cpe());
        assert!(!log_message(&handle, Direction::ServerBound, &msg_packet()));
    }

    #[test]
    fn trace_packet_never_handles() {
        let mut config = crate::config::Config::default();
        config.ignore_packets.insert(crate::packet::ID_MESSAGE);
        let server = Server::new_for_test(config, "salt".to_string());
        let handled = trace_packet(&server, &PlayerHandle::detached(), Direction::ServerBound, &msg_packet());
        assert!(!handled);
    }

    #[test]
    fn unregister_all_clears_both_buckets() {
        let mut registry = HookRegistry::new();
        registry.register(ALL_PACKETS, Box::new(|_, _, _| false));
        registry.register(crate::packet::ID_MESSAGE, Box::new(|_, _, _| false));
        registry.unregister_all();
        assert!(!registry.dispatch(&PlayerHandle::detached(), Direction::ServerBound, &msg_packet()));
    }
}
