/*!
 * Negotiation
 *
 * Startup stall and the connect handshake for one direction, run with the
 * nexus held. Every step happens under the lock's exclusive mode; the
 * lock is lowered while parked so the peer can answer.
 *
 * Outcomes, by what the peer's slot shows:
 * - nothing outstanding: propose a new stream and wait for an answer
 * - a request for the opposite direction: map its stream and ack
 * - a request for the same direction: nak it and shut down
 * - shutdown: give up
 */

use super::nexus::NexusInner;
use super::types::{FallbackReason, Verdict};
use crate::core::config::BypassConfig;
use crate::core::errors::{BypassError, BypassResult};
use crate::core::limits::COMMBUF_MIN_BLOCK;
use crate::core::types::{Direction, StreamId};
use crate::ipc::lock::{NegotiationLock, Slot, SlotFlags};
use crate::ipc::memstream::{MemStream, StreamOptions, StreamRole};
use crate::ipc::shm::{segment_name, SharedSegment};
use std::sync::Arc;
use tracing::debug;

/// What to do about the peer's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Propose,
    Accept,
    Conflict,
    Abandon,
    Forced,
}

/// Classify a present peer's slot against our own
pub(crate) fn classify(mine: &Slot, peer: &Slot, direction: Direction) -> Action {
    if peer.is_shutdown() {
        Action::Abandon
    } else if mine.has_outstanding_request() {
        Action::Forced
    } else if !peer.has_outstanding_request() {
        Action::Propose
    } else if peer.flags.contains(SlotFlags::WILL_WRITE) != direction.is_write() {
        Action::Accept
    } else {
        Action::Conflict
    }
}

/// Stream id above both sides' last one; zero is never used
pub(crate) fn next_stream_id(mine: StreamId, peer: StreamId) -> StreamId {
    mine.max(peer).wrapping_add(1).max(1)
}

fn role_for(direction: Direction) -> StreamRole {
    match direction {
        Direction::Read => StreamRole::Reader,
        Direction::Write => StreamRole::Writer,
    }
}

/// Stall for a peer and negotiate `direction`
pub(crate) fn stall(
    inner: &mut NexusInner,
    direction: Direction,
    config: &BypassConfig,
) -> BypassResult<Verdict> {
    let Some(lock) = inner.lock.as_mut() else {
        return Ok(Verdict::Fallback(FallbackReason::NoLock));
    };

    lock.raise()?;
    let result = stall_exclusive(lock, direction, config);
    let lowered = lock.lower();
    let verdict = result?;
    lowered?;
    Ok(verdict)
}

fn stall_exclusive(
    lock: &mut NegotiationLock,
    direction: Direction,
    config: &BypassConfig,
) -> BypassResult<Verdict> {
    if lock.mine().is_shutdown() {
        return Ok(Verdict::Fallback(FallbackReason::Shutdown));
    }

    if !lock.peer_present() && !lock.stall_for_peer(config.startup_stall())? {
        debug!(resource = lock.resource(), %direction, "No peer appeared");
        lock.mine_mut().flags.insert(SlotFlags::SHUTDOWN);
        return Ok(Verdict::Fallback(FallbackReason::NoPeer));
    }

    let action = classify(lock.mine(), lock.peer(), direction);
    debug!(
        resource = lock.resource(),
        %direction,
        ?action,
        peer = lock.peer().pid,
        "Peer classified"
    );

    match action {
        Action::Propose => propose(lock, direction, config),
        Action::Accept => accept(lock, direction, config),
        Action::Conflict => {
            lock.peer_mut().flags.insert(SlotFlags::PEER_NAK);
            lock.mine_mut().flags.insert(SlotFlags::SHUTDOWN);
            lock.wake_peer_if_waiting();
            Ok(Verdict::Fallback(FallbackReason::Conflict))
        }
        Action::Abandon => {
            lock.mine_mut().flags.insert(SlotFlags::SHUTDOWN);
            Ok(Verdict::Fallback(FallbackReason::Shutdown))
        }
        Action::Forced => Ok(Verdict::Fallback(FallbackReason::Unexpected)),
    }
}

fn propose(
    lock: &mut NegotiationLock,
    direction: Direction,
    config: &BypassConfig,
) -> BypassResult<Verdict> {
    let id = next_stream_id(lock.mine().stream_id, lock.peer().stream_id);
    let name = segment_name(lock.resource(), id);

    SharedSegment::remove(&name)?;
    let segment = Arc::new(SharedSegment::create_or_map(&name, config.block_size)?);
    segment.set_unlink_on_drop(true);
    let stream = MemStream::create(
        segment.clone(),
        role_for(direction),
        &StreamOptions::from_config(config),
    )?;

    let mine = lock.mine_mut();
    mine.stream_id = id;
    mine.flags.remove(SlotFlags::PEER_ACK | SlotFlags::PEER_NAK);
    mine.flags.insert(SlotFlags::CONNECT_REQUEST);
    mine.flags.set(SlotFlags::WILL_WRITE, direction.is_write());
    lock.wake_peer_if_waiting();
    debug!(segment = %name, %direction, "Connect request posted");

    let answered = lock.wait_for_peer(config.negotiation_timeout())?;
    let flags = lock.mine().flags;
    lock.mine_mut()
        .flags
        .remove(SlotFlags::CONNECT_REQUEST | SlotFlags::PEER_ACK | SlotFlags::PEER_NAK);

    if flags.contains(SlotFlags::PEER_ACK) && !flags.contains(SlotFlags::PEER_NAK) {
        segment.set_unlink_on_drop(false);
        return Ok(Verdict::Established(stream));
    }

    let reason = if flags.contains(SlotFlags::PEER_NAK) {
        FallbackReason::Refused
    } else if !answered {
        FallbackReason::Timeout
    } else {
        FallbackReason::Shutdown
    };
    lock.mine_mut().flags.insert(SlotFlags::SHUTDOWN);
    stream.close()?;
    Ok(Verdict::Fallback(reason))
}

fn accept(
    lock: &mut NegotiationLock,
    direction: Direction,
    config: &BypassConfig,
) -> BypassResult<Verdict> {
    let peer = *lock.peer();
    let name = segment_name(lock.resource(), peer.stream_id);

    let attached = SharedSegment::open(&name, COMMBUF_MIN_BLOCK)
        .map_err(BypassError::from)
        .and_then(|segment| {
            MemStream::create(
                Arc::new(segment),
                role_for(direction),
                &StreamOptions::from_config(config),
            )
            .map_err(BypassError::from)
        });

    let verdict = match attached {
        Ok(stream) => {
            // Both sides are mapped; the name is no longer needed
            if let Err(e) = SharedSegment::remove(&name) {
                debug!(segment = %name, error = %e, "Failed to unlink accepted segment");
            }
            lock.peer_mut().flags.insert(SlotFlags::PEER_ACK);
            lock.mine_mut().stream_id = peer.stream_id;
            debug!(segment = %name, %direction, "Connect request accepted");
            Verdict::Established(stream)
        }
        Err(e) => {
            debug!(segment = %name, error = %e, "Connect request refused");
            lock.peer_mut().flags.insert(SlotFlags::PEER_NAK);
            Verdict::Fallback(FallbackReason::Failed)
        }
    };
    lock.wake_peer_if_waiting();
    Ok(verdict)
}
