use std::sync::Arc;

use tracing::info;

use crate::credential::{Credential, KeyPool};
use crate::rotation::RotationCounter;
use crate::{RelayError, Result};

/// Keys to try for one request: the rotated primary, then every other pool
/// member in ascending pool order.
#[derive(Clone, Debug)]
pub struct Selection {
    pub index: usize,
    pub primary: Credential,
    pub fallbacks: Vec<Credential>,
}

impl Selection {
    pub fn from_index(pool: &KeyPool, index: usize) -> Option<Self> {
        let primary = pool.get(index)?.clone();
        let fallbacks = pool
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, key)| key.clone())
            .collect();
        Some(Self {
            index,
            primary,
            fallbacks,
        })
    }

    pub fn len(&self) -> usize {
        1 + self.fallbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn attempt_order(&self) -> impl Iterator<Item = &Credential> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }
}

#[derive(Clone)]
pub struct KeySelector {
    pool: KeyPool,
    counter: Arc<dyn RotationCounter>,
}

impl KeySelector {
    pub fn new(pool: KeyPool, counter: Arc<dyn RotationCounter>) -> Self {
        Self { pool, counter }
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    /// Advances the shared counter and builds the selection. Blocks on the
    /// counter lock.
    pub fn select_blocking(&self) -> Result<Selection> {
        let index = self.counter.acquire_and_advance(self.pool.len())?;
        let selection = Selection::from_index(&self.pool, index).ok_or_else(|| {
            RelayError::InvalidResponse(format!(
                "rotation counter returned index {index} for a pool of {}",
                self.pool.len()
            ))
        })?;
        info!(
            key_number = index + 1,
            pool_size = self.pool.len(),
            "selected primary key"
        );
        Ok(selection)
    }

    /// Same as [`Self::select_blocking`], run off the async executor.
    pub async fn select(&self) -> Result<Selection> {
        let selector = self.clone();
        tokio::task::spawn_blocking(move || selector.select_blocking())
            .await
            .map_err(|err| {
                RelayError::InvalidResponse(format!("key selection task failed: {err}"))
            })?
    }
}

impl std::fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySelector")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::MemoryRotationCounter;

    fn pool(raw: &str) -> KeyPool {
        KeyPool::load(raw).unwrap()
    }

    fn names(selection: &Selection) -> Vec<&str> {
        selection.attempt_order().map(Credential::expose).collect()
    }

    #[test]
    fn fallbacks_keep_pool_order_without_wrapping() {
        let selection = Selection::from_index(&pool("a,b,c,d"), 2).unwrap();
        assert_eq!(selection.primary.expose(), "c");
        assert_eq!(names(&selection), vec!["c", "a", "b", "d"]);
        assert_eq!(selection.len(), 4);
    }

    #[test]
    fn single_key_pool_has_no_fallbacks() {
        let selection = Selection::from_index(&pool("only"), 0).unwrap();
        assert!(selection.fallbacks.is_empty());
        assert_eq!(selection.len(), 1);
    }

    #[test]
    fn out_of_range_index_yields_nothing() {
        assert!(Selection::from_index(&pool("a,b"), 2).is_none());
    }

    #[test]
    fn selector_rotates_primary() -> Result<()> {
        let selector = KeySelector::new(pool("a,b,c"), Arc::new(MemoryRotationCounter::default()));
        let primaries: Vec<String> = (0..4)
            .map(|_| selector.select_blocking().map(|s| s.primary.expose().to_string()))
            .collect::<Result<_>>()?;
        assert_eq!(primaries, vec!["a", "b", "c", "a"]);
        Ok(())
    }

    #[tokio::test]
    async fn async_select_advances_counter() -> Result<()> {
        let selector = KeySelector::new(pool("a,b"), Arc::new(MemoryRotationCounter::new(1)));
        let selection = selector.select().await?;
        assert_eq!(selection.index, 1);
        assert_eq!(names(&selection), vec!["b", "a"]);
        Ok(())
    }
}
