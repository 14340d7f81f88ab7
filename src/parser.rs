//! `HookedParser`: a `PacketDecoder` wrapper that applies a read-idle
//! timeout and dispatches registered hooks per decoded packet.

use crate::hooks::{Direction, Hook, HookRegistry};
use crate::packet::{Packet, PacketDecoder};
use crate::player::PlayerHandle;
use std::time::Duration;
use tokio::io::AsyncRead;

/// The outcome of a single `HookedParser::next()` call.
#[derive(Debug)]
pub enum NextOutcome {
    /// A packet was decoded and no hook claimed it; forward it.
    Packet(Packet),
    /// A hook handled the packet; the caller should loop and call `next`
    /// again rather than forwarding anything.
    Skipped,
    /// The parser has stopped for good (idle timeout, or `finish()` was
    /// called). Every subsequent call also returns `Finished`.
    Finished,
}

pub struct HookedParser<R> {
    decoder: PacketDecoder<R>,
    registry: HookRegistry,
    direction: Direction,
    timeout: Duration,
    finished: bool,
    /// When set, `next()` bypasses hook dispatch entirely but still
    /// returns decoded packets.
    pub disable: bool,
}

impl<R: AsyncRead + Unpin> HookedParser<R> {
    pub fn new(reader: R, direction: Direction, timeout: Duration) -> Self {
        HookedParser {
            decoder: PacketDecoder::new(reader),
            registry: HookRegistry::new(),
            direction,
            timeout,
            finished: false,
            disable: false,
        }
    }

    pub fn register(&mut self, packet_id: u8, hook: Hook) -> String {
        self.registry.register(packet_id, hook)
    }

    pub fn unregister(&mut self, hook_id: &str) -> bool {
        self.registry.unregister(hook_id)
    }

    pub fn unregister_all(&mut self) {
        self.registry.unregister_all();
    }

    /// Idempotent. After this call every `next()` returns `Finished`
    /// without touching the underlying stream.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Reads and decodes the next packet, applying the read-idle timeout
    /// and hook dispatch. `player` is passed through to hooks unchanged.
    pub async fn next(&mut self, player: &PlayerHandle) -> std::io::Result<NextOutcome> {
        if self.finished {
            return Ok(NextOutcome::Finished);
        }

        let decoded = match tokio::time::timeout(self.timeout, self.decoder.next()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                self.finish();
                return Ok(NextOutcome::Finished);
            }
        };
        let packet = decoded?;

        if self.disable {
            return Ok(NextOutcome::Packet(packet));
        }

        if self.registry.dispatch(player, self.direction, &packet) {
            return Ok(NextOutcome::Skipped);
        }

        Ok(NextOutcome::Packet(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::write_packet;
    use tokio::io::duplex;

    #[tokio::test]
    async fn closed_stream_is_a_transport_error_not_idle_timeout() {
        let (client, server) = duplex(64);
        drop(client);
        let mut parser = HookedParser::new(server, Direction::ServerBound, Duration::from_secs(5));
        let handle = PlayerHandle::detached();
        assert!(parser.next(&handle).await.is_err());
    }

    #[tokio::test]
    async fn idle_timeout_yields_finished_and_stays_finished() {
        let (_client, server) = duplex(64);
        let mut parser = HookedParser::new(server, Direction::ServerBound, Duration::from_millis(20));
        let handle = PlayerHandle::detached();
        assert!(matches!(parser.next(&handle).await, Ok(NextOutcome::Finished)));
        assert!(matches!(parser.next(&handle).await, Ok(NextOutcome::Finished)));
    }

    #[tokio::test]
    async fn disable_bypasses_hooks_but_still_decodes() {
        let (mut client, server) = duplex(256);
        let packet = Packet::new_message(1, "hi");
        write_packet(&mut client, &packet).await.unwrap();

        let mut parser = HookedParser::new(server, Direction::ServerBound, Duration::from_secs(5));
        parser.register(crate::packet::ALL_PACKETS, Box::new(|_, _, _| true));
        parser.disable = true;

        let handle = PlayerHandle::detached();
        let outcome = parser.next(&handle).await.unwrap();
        assert!(matches!(outcome, NextOutcome::Packet(_)));
    }

    #[tokio::test]
    async fn hook_returning_true_yields_skipped() {
        let (mut client, server) = duplex(256);
        write_packet(&mut client, &Packet::new_message(1, "hi")).await.unwrap();

        let mut parser = HookedParser::new(server, Direction::ServerBound, Duration::from_secs(5));
        parser.register(crate::packet::ID_MESSAGE, Box::new(|_, _, _| true));

        let handle = PlayerHandle::detached();
        let outcome = parser.next(&handle).await.unwrap();
        assert!(matches!(outcome, NextOutcome::Skipped));
    }
}
