//! Guild member chunking.
//!
//! Rosters arrive as a stream of GUILD_MEMBERS_CHUNK events with no
//! terminator; completion is detected by inactivity. Concurrent
//! requests for the same guild coalesce onto the running flow, and a
//! finished flow stays visible briefly so near-simultaneous callers
//! return without re-requesting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, warn};

use super::Shard;
use crate::error::GatewayError;
use crate::wire::{GatewayOp, RequestGuildMembers};

/// Abort the flow if no chunk at all arrives in this window.
const INITIAL_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// A quiet period this long after the last chunk means the roster is
/// complete.
const CHUNK_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the completed flag stays in the maps after a flow ends.
const CHUNK_STATE_PERSIST: Duration = Duration::from_secs(10);

enum Claim {
    /// This caller owns the flow and must run it.
    Owner,
    /// A previous flow finished recently; nothing to do.
    Done,
    /// A flow is running; wait on its callback.
    InProgress(Option<watch::Receiver<bool>>),
}

impl Shard {
    /// Request the full member roster for a guild.
    ///
    /// With `wait` set the call returns once chunking completes (or
    /// fails); otherwise the flow runs in the background. Calls for a
    /// guild that is already chunking wait on the running flow instead
    /// of sending a second request.
    pub async fn chunk_guild(self: &Arc<Self>, guild_id: u64, wait: bool) -> Result<(), GatewayError> {
        if let Some(flag) = self
            .group
            .chunks_complete
            .get(&guild_id)
            .map(|e| Arc::clone(&e))
        {
            if flag.load(Ordering::Acquire) {
                return Ok(());
            }

            let callback = self.group.chunks_callback.get(&guild_id).map(|e| e.clone());
            match callback {
                Some(mut rx) => {
                    debug!(guild_id, "Waiting on running chunk flow");
                    let _ = rx.wait_for(|done| *done).await;
                }
                None => {
                    warn!(guild_id, "Chunk flow marked in progress but no callback exists");
                }
            }
            return Ok(());
        }

        if wait {
            self.chunk_guild_flow(guild_id, false).await
        } else {
            let shard = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = shard.chunk_guild_flow(guild_id, true).await {
                    warn!(guild_id, error = %e, "Background chunk flow failed");
                }
            });
            Ok(())
        }
    }

    /// Run one chunk flow, owning all per-guild state.
    async fn chunk_guild_flow(
        self: &Arc<Self>,
        guild_id: u64,
        wait_for_ticket: bool,
    ) -> Result<(), GatewayError> {
        let _ticket = if wait_for_ticket {
            Some(self.group.chunk_limiter.wait().await)
        } else {
            None
        };

        let completed = Arc::new(AtomicBool::new(false));
        let (callback_tx, callback_rx) = watch::channel(false);
        let (arrival_tx, mut arrival_rx) = mpsc::channel(1);

        // Claim the guild. Losing the race degrades into waiting on the
        // winner, so at most one request goes out per guild.
        let claim = match self.group.chunks_complete.entry(guild_id) {
            Entry::Occupied(entry) => {
                if entry.get().load(Ordering::Acquire) {
                    Claim::Done
                } else {
                    Claim::InProgress(
                        self.group.chunks_callback.get(&guild_id).map(|e| e.clone()),
                    )
                }
            }
            Entry::Vacant(entry) => {
                self.group.chunks_callback.insert(guild_id, callback_rx);
                self.group.chunk_arrivals.insert(guild_id, arrival_tx);
                entry.insert(Arc::clone(&completed));
                Claim::Owner
            }
        };

        match claim {
            Claim::Done => return Ok(()),
            Claim::InProgress(callback) => {
                if let Some(mut rx) = callback {
                    let _ = rx.wait_for(|done| *done).await;
                }
                return Ok(());
            }
            Claim::Owner => {}
        }

        let start = Instant::now();
        debug!(guild_id, shard_id = self.shard_id, "Preparing to chunk guild");

        if let Err(e) = self
            .send_event(
                GatewayOp::RequestGuildMembers,
                RequestGuildMembers {
                    guild_id,
                    query: String::new(),
                    limit: 0,
                },
            )
            .await
        {
            warn!(guild_id, error = %e, "Failed to request guild members");
            self.group.clean_guild_chunks(guild_id);
            return Err(e);
        }

        match timeout(INITIAL_CHUNK_TIMEOUT, arrival_rx.recv()).await {
            Ok(Some(())) => {}
            Ok(None) | Err(_) => {
                warn!(guild_id, "Timed out on initial member chunks");
                self.group.clean_guild_chunks(guild_id);
                return Err(GatewayError::ChunkTimeout { guild_id });
            }
        }

        let mut received = 1u32;
        loop {
            match timeout(CHUNK_IDLE_TIMEOUT, arrival_rx.recv()).await {
                Ok(Some(())) => received += 1,
                Ok(None) | Err(_) => break,
            }
        }

        debug!(
            guild_id,
            received,
            duration_ms = start.elapsed().as_millis() as u64,
            "Guild chunking complete"
        );

        completed.store(true, Ordering::Release);
        let _ = callback_tx.send(true);

        let group = Arc::clone(&self.group);
        tokio::spawn(async move {
            tokio::time::sleep(CHUNK_STATE_PERSIST).await;
            group.clean_guild_chunks(guild_id);
            debug!(guild_id, "Cleaned member chunk tables");
        });

        Ok(())
    }

    /// Signal the running chunk flow for a guild, if any. Called from
    /// the inbound-event path on every GUILD_MEMBERS_CHUNK; the signal
    /// coalesces, so the flow never lags behind the socket.
    pub(super) fn signal_chunk_arrival(&self, guild_id: u64) {
        if let Some(tx) = self.group.chunk_arrivals.get(&guild_id) {
            let _ = tx.try_send(());
        }
    }
}
