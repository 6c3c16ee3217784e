use sha2::{Digest, Sha256};

/// Select the owner of `key` among `peers` using rendezvous hashing. Every
/// node with the same peer set picks the same owner, and removing a peer only
/// moves the keys that peer owned. Returns `None` if there are no peers.
pub fn select_owner<'a>(key: &str, peers: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(u64, &'a str)> = None;
    for peer in peers {
        let score = score(key, peer);
        // Ties fall back to the peer id so the choice never depends on order.
        let better = match best {
            Some((best_score, best_peer)) => {
                score > best_score || (score == best_score && peer.as_str() > best_peer)
            }
            None => true,
        };
        if better {
            best = Some((score, peer.as_str()));
        }
    }
    best.map(|(_, peer)| peer)
}

fn score(key: &str, peer: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(peer.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
