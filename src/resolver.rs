//! Walks `referred_by` pointers from a buyer up to [`MAX_DEPTH`] ancestors.

use std::collections::HashSet;
use std::future::Future;

use anyhow::Result;
use tracing::error;

use crate::types::{Ancestor, UserId};

/// Deepest ancestor level that earns commission.
pub const MAX_DEPTH: u8 = 8;

/// Read access to the `user -> referrer` index.
pub trait ReferralGraph {
    fn referrer_of(&self, user_id: UserId) -> impl Future<Output = Result<Option<UserId>>> + Send;
}

/// A resolved referral chain, nearest ancestor first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ancestry {
    pub ancestors: Vec<Ancestor>,
    /// Set when the walk met an id it had already visited.
    pub cycle_at: Option<UserId>,
}

impl Ancestry {
    pub fn is_empty(&self) -> bool {
        self.ancestors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ancestors.len()
    }
}

/// Resolves up to [`MAX_DEPTH`] ancestors of `user_id`.
///
/// Stops at a user without a referrer, at the depth bound, or at the first
/// repeated id. A repeat is a data-integrity fault: it is logged and the chain
/// is truncated before the repeat.
pub async fn resolve_ancestry<G>(graph: &G, user_id: UserId) -> Result<Ancestry>
where
    G: ReferralGraph + Sync,
{
    let mut visited = HashSet::from([user_id]);
    let mut ancestry = Ancestry::default();
    let mut current = user_id;

    for level in 1..=MAX_DEPTH {
        let Some(referrer) = graph.referrer_of(current).await? else {
            break;
        };
        if !visited.insert(referrer) {
            error!(
                user_id,
                referrer,
                level,
                "referral cycle detected, truncating ancestry"
            );
            ancestry.cycle_at = Some(referrer);
            break;
        }
        ancestry.ancestors.push(Ancestor {
            user_id: referrer,
            level,
        });
        current = referrer;
    }

    Ok(ancestry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Edges(HashMap<UserId, UserId>);

    impl ReferralGraph for Edges {
        async fn referrer_of(&self, user_id: UserId) -> Result<Option<UserId>> {
            Ok(self.0.get(&user_id).copied())
        }
    }

    fn chain(len: i64) -> Edges {
        // user n was referred by user n + 1
        Edges((1..=len).map(|u| (u, u + 1)).collect())
    }

    #[tokio::test]
    async fn no_referrer_yields_empty_chain() {
        let graph = Edges(HashMap::new());
        let ancestry = resolve_ancestry(&graph, 42).await.unwrap();
        assert!(ancestry.is_empty());
        assert_eq!(ancestry.cycle_at, None);
    }

    #[tokio::test]
    async fn levels_are_numbered_nearest_first() {
        let graph = chain(3);
        let ancestry = resolve_ancestry(&graph, 1).await.unwrap();
        assert_eq!(
            ancestry.ancestors,
            vec![
                Ancestor { user_id: 2, level: 1 },
                Ancestor { user_id: 3, level: 2 },
                Ancestor { user_id: 4, level: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn long_chain_is_capped_at_eight() {
        let graph = chain(20);
        let ancestry = resolve_ancestry(&graph, 1).await.unwrap();
        assert_eq!(ancestry.len(), usize::from(MAX_DEPTH));
        assert_eq!(ancestry.ancestors.last().map(|a| a.user_id), Some(9));
    }

    #[tokio::test]
    async fn cycle_is_truncated_at_the_repeat() {
        // 1 -> 2 -> 3 -> 1
        let graph = Edges(HashMap::from([(1, 2), (2, 3), (3, 1)]));
        let ancestry = resolve_ancestry(&graph, 1).await.unwrap();
        let ids: Vec<_> = ancestry.ancestors.iter().map(|a| a.user_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(ancestry.cycle_at, Some(1));
    }

    #[tokio::test]
    async fn self_referral_is_a_cycle() {
        let graph = Edges(HashMap::from([(7, 7)]));
        let ancestry = resolve_ancestry(&graph, 7).await.unwrap();
        assert!(ancestry.is_empty());
        assert_eq!(ancestry.cycle_at, Some(7));
    }

    #[tokio::test]
    async fn never_revisits_an_id() {
        let graph = Edges(HashMap::from([(1, 2), (2, 3), (3, 4), (4, 2)]));
        let ancestry = resolve_ancestry(&graph, 1).await.unwrap();
        let ids: HashSet<_> = ancestry.ancestors.iter().map(|a| a.user_id).collect();
        assert_eq!(ids.len(), ancestry.len());
        assert_eq!(ancestry.cycle_at, Some(2));
    }
}
