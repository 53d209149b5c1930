//! # Canonical Hash Trie Builder
//!
//! A light server periodically commits the canonical chain into Merkle
//! tries so light clients can verify historical headers by proof instead of
//! downloading them. CHT number `n` (1-based) commits block range
//! `[(n-1)*F, n*F)`, mapping `be64(number)` to the RLP pair
//! `[canonical_hash, total_difficulty]`. A CHT is only built once the head
//! is `F/2` blocks past the end of its range, and each trie is opened from
//! the previous CHT's root so the chain of commitments stays linked.
//!
//! [`spawn_head_loop`] runs the builder on its own background task: it
//! subscribes to chain head events, announces each new head
//! to the connected light peers, and arms a self-trigger channel that
//! re-fires every 10 ms while CHTs are pending, so a cold start catches up
//! without blocking the event stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::NodeDb;
use crate::identity::Hash;
use crate::protocols::{ChainHeadEvent, ChainStore, ChtTrie, HeadAnnouncement, PeerSet, TrieFactory};
use crate::rlp;

/// Delay between catch-up passes while CHTs are pending.
const CATCH_UP_DELAY: Duration = Duration::from_millis(10);

/// CHT layout parameters, fixed by the light-client protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChtConfig {
    /// Blocks per CHT.
    pub frequency: u64,
    /// Confirmations required past a range before its CHT is built.
    pub confirmations: u64,
}

impl ChtConfig {
    pub fn new(frequency: u64) -> Self {
        ChtConfig { frequency, confirmations: frequency / 2 }
    }
}

/// Serialized builder of pending CHTs.
pub struct ChtBuilder<C, F> {
    db: NodeDb,
    chain: Arc<C>,
    tries: Arc<F>,
    config: ChtConfig,
}

impl<C: ChainStore, F: TrieFactory> ChtBuilder<C, F> {
    pub fn new(db: NodeDb, chain: Arc<C>, tries: Arc<F>, config: ChtConfig) -> Self {
        ChtBuilder { db, chain, tries, config }
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    /// Build at most one pending CHT. Returns whether more remain, so the
    /// caller can re-arm the catch-up trigger.
    ///
    /// Panics when a block inside the range has no canonical hash or total
    /// difficulty: that is chain corruption and must not be masked.
    pub fn make_cht(&self) -> bool {
        let head_hash = self.chain.head_block_hash();
        let head_num = self.chain.block_number(&head_hash).unwrap_or(0);
        let new_cht_num = if head_num > self.config.confirmations {
            (head_num - self.config.confirmations) / self.config.frequency
        } else {
            0
        };

        let mut last_cht_num = self.db.last_cht_number();
        if new_cht_num <= last_cht_num {
            return false;
        }

        let mut trie = if last_cht_num > 0 {
            match self.db.cht_root(last_cht_num).map(|root| self.tries.open(root)) {
                Some(Ok(trie)) => trie,
                opened => {
                    // Previous root unusable: restart the commitment chain
                    // from scratch. Earlier CHTs stay in the database but
                    // are no longer linked.
                    if let Some(Err(err)) = opened {
                        warn!(cht = last_cht_num, %err, "previous cht root unopenable, rebuilding from empty");
                    } else {
                        warn!(cht = last_cht_num, "previous cht root missing, rebuilding from empty");
                    }
                    last_cht_num = 0;
                    match self.tries.open(Hash::ZERO) {
                        Ok(trie) => trie,
                        Err(err) => {
                            warn!(%err, "empty trie unopenable");
                            return new_cht_num > 0;
                        }
                    }
                }
            }
        } else {
            match self.tries.open(Hash::ZERO) {
                Ok(trie) => trie,
                Err(err) => {
                    warn!(%err, "empty trie unopenable");
                    return new_cht_num > 0;
                }
            }
        };

        let start = last_cht_num * self.config.frequency;
        for num in start..start + self.config.frequency {
            let hash = self
                .chain
                .canonical_hash(num)
                .unwrap_or_else(|| panic!("canonical hash not found for block {num}"));
            let td = self
                .chain
                .td(&hash, num)
                .unwrap_or_else(|| panic!("total difficulty not found for block {num}"));
            let value =
                rlp::encode_list(&[rlp::encode_bytes(hash.as_bytes()), rlp::encode_u128(td)]);
            trie.update(&num.to_be_bytes(), &value);
        }

        match trie.commit() {
            Ok(root) => {
                last_cht_num += 1;
                self.db.store_cht_root(last_cht_num, root);
                self.db.store_last_cht_number(last_cht_num);
                info!(cht = last_cht_num, root = %root, "cht committed");
            }
            Err(err) => {
                warn!(%err, "cht commit failed");
                last_cht_num = 0;
            }
        }

        new_cht_num > last_cht_num
    }
}

/// Spawn the background head loop: announce new heads to light peers,
/// then drive the CHT builder until it has caught up. Terminates when the
/// shutdown signal flips or the event bus closes.
pub fn spawn_head_loop<C, F, P>(
    builder: ChtBuilder<C, F>,
    peers: Arc<P>,
    mut head_events: broadcast::Receiver<ChainHeadEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    C: ChainStore + 'static,
    F: TrieFactory + 'static,
    P: PeerSet + 'static,
{
    tokio::spawn(async move {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(10);
        // Prime one pass so a cold start catches up immediately.
        let _ = trigger_tx.try_send(());

        loop {
            tokio::select! {
                event = head_events.recv() => match event {
                    Ok(head) => {
                        announce_head(builder.chain(), &*peers, head);
                        let _ = trigger_tx.try_send(());
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "head event stream lagged");
                        let _ = trigger_tx.try_send(());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = trigger_rx.recv() => {
                    if builder.make_cht() {
                        tokio::time::sleep(CATCH_UP_DELAY).await;
                        let _ = trigger_tx.try_send(());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("cht head loop terminated");
    })
}

/// Fan the new head out to every connected light peer, one send task each.
fn announce_head<C: ChainStore>(chain: &Arc<C>, peers: &dyn PeerSet, head: ChainHeadEvent) {
    let connected = peers.all_peers();
    if connected.is_empty() {
        return;
    }
    let Some(td) = chain.td(&head.hash, head.number) else {
        warn!(number = head.number, hash = %head.hash, "head announced without total difficulty");
        return;
    };
    let announce = HeadAnnouncement { hash: head.hash, number: head.number, td };
    for peer in connected {
        tokio::spawn(async move {
            if let Err(err) = peer.send_new_block_hashes(vec![announce]).await {
                debug!(%err, "head announcement failed");
            }
        });
    }
}
