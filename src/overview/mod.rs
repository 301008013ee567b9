//! C5: the overview API facade. Wraps the chosen backend (today, only
//! [`buffindexed`]) with the caller-visible contract and an LRU cache for
//! the repeated single-article fetches nnrpd's `HEAD`/`STAT` loops produce.

pub mod buffindexed;
pub mod shmem;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Error;
use crate::token::Token;

pub use buffindexed::{Buffindexed, Search, SearchResult};

/// One article's worth of overview data handed to `add`.
#[derive(Debug, Clone)]
pub struct OverviewArticle {
    pub number: u64,
    pub line: Vec<u8>,
    pub token: Token,
    pub arrived: i64,
    pub expires: i64,
}

/// Fixed-capacity LRU, oldest entry evicted first. A `HashMap` plus a
/// separate insertion-order `Vec` is simpler to reason about than an
/// intrusive linked list for the modest sizes `overcachesize` implies.
struct Cache {
    capacity: usize,
    order: Vec<(String, u64)>,
    entries: HashMap<(String, u64), SearchResult>,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Cache { capacity, order: Vec::new(), entries: HashMap::new() }
    }

    fn get(&mut self, group: &str, number: u64) -> Option<SearchResult> {
        let key = (group.to_string(), number);
        if let Some(v) = self.entries.get(&key) {
            let v = v.clone();
            self.touch(&key);
            return Some(v);
        }
        None
    }

    fn touch(&mut self, key: &(String, u64)) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn put(&mut self, group: &str, number: u64, value: SearchResult) {
        let key = (group.to_string(), number);
        if !self.entries.contains_key(&key) {
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.first().cloned() {
                    self.order.remove(0);
                    self.entries.remove(&oldest);
                }
            }
            self.order.push(key.clone());
        } else {
            self.touch(&key);
        }
        self.entries.insert(key, value);
    }

    fn invalidate(&mut self, group: &str, number: u64) {
        let key = (group.to_string(), number);
        self.entries.remove(&key);
        self.order.retain(|k| k != &key);
    }
}

/// The facade a server process holds onto. `overcachesize` comes straight
/// out of [`crate::config::InnConf`].
pub struct Overview {
    backend: Buffindexed,
    cache: Mutex<Cache>,
}

impl Overview {
    pub fn open(buffer_path: impl AsRef<std::path::Path>, sync_every: u32, overcachesize: usize) -> Result<Self, Error> {
        let backend = Buffindexed::open(buffer_path, sync_every)?;
        Ok(Overview { backend, cache: Mutex::new(Cache::new(overcachesize.max(1))) })
    }

    pub fn group_add(&self, name: &str) -> Result<(), Error> {
        self.backend.group_add(name)
    }

    pub fn group_stats(&self, name: &str) -> Result<(u64, u64, u64, u8), Error> {
        self.backend.group_stats(name)
    }

    pub fn add(&self, group: &str, article: OverviewArticle) -> Result<(), Error> {
        self.backend.add(group, article.number, &article.line, article.token, article.arrived, article.expires)?;
        self.cache.lock().unwrap().invalidate(group, article.number);
        Ok(())
    }

    /// Assigns the next article number for `group` and appends under it;
    /// what the injection pipeline calls instead of picking a number
    /// itself and racing other writers to the same group.
    pub fn append(&self, group: &str, line: &[u8], token: Token, arrived: i64, expires: i64) -> Result<u64, Error> {
        let number = self.backend.add_next(group, line, token, arrived, expires)?;
        self.cache.lock().unwrap().invalidate(group, number);
        Ok(number)
    }

    /// Runs `body` with every one of `groups`' write locks held; see
    /// [`Buffindexed::with_group_locks`]. What the injection pipeline uses
    /// to peek next-article-numbers and commit the matching entries as one
    /// atomic span across a crosspost's groups.
    pub fn with_group_locks<R>(&self, groups: &[String], body: impl FnOnce() -> Result<R, Error>) -> Result<R, Error> {
        self.backend.with_group_locks(groups, body)
    }

    pub fn search_open(&self, group: &str, lo: u64, hi: u64) -> Result<Search, Error> {
        self.backend.search_open(group, lo, hi)
    }

    pub fn search_next(&self, search: &mut Search) -> Result<Option<SearchResult>, Error> {
        self.backend.search_next(search)
    }

    /// No teardown is required on the in-memory cursor; kept for contract
    /// symmetry with the caller-visible API and so a future backend with a
    /// real open resource (e.g. a held read lock) has somewhere to release
    /// it.
    pub fn search_close(&self, _search: Search) {}

    pub fn token(&self, group: &str, number: u64) -> Result<Option<Token>, Error> {
        if let Some(cached) = self.cache.lock().unwrap().get(group, number) {
            return Ok(Some(cached.token));
        }
        let mut search = self.backend.search_open(group, number, number)?;
        match self.backend.search_next(&mut search)? {
            Some(result) => {
                let token = result.token;
                self.cache.lock().unwrap().put(group, number, result);
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    pub fn cancel(&self, group: &str, number: u64) -> Result<bool, Error> {
        let cancelled = self.backend.cancel(group, number)?;
        self.cache.lock().unwrap().invalidate(group, number);
        Ok(cancelled)
    }

    pub fn expire_group(&self, group: &str, cutoff: i64, now: i64) -> Result<u64, Error> {
        self.backend.expire_group(group, cutoff, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_article(n: u64) -> OverviewArticle {
        OverviewArticle {
            number: n,
            line: format!("Subject: test {}\tLines: 1", n).into_bytes(),
            token: Token::new(1, 0x41, [n as u8; 16]),
            arrived: 0,
            expires: 0,
        }
    }

    #[test]
    fn token_lookup_is_cached_after_first_fetch() {
        let dir = tempdir().unwrap();
        let ov = Overview::open(dir.path().join("buffer"), 10, 4).unwrap();
        ov.group_add("misc.test").unwrap();
        ov.add("misc.test", sample_article(1)).unwrap();

        let first = ov.token("misc.test", 1).unwrap().unwrap();
        let second = ov.token("misc.test", 1).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cancel_invalidates_cached_entry() {
        let dir = tempdir().unwrap();
        let ov = Overview::open(dir.path().join("buffer"), 10, 4).unwrap();
        ov.group_add("misc.test").unwrap();
        ov.add("misc.test", sample_article(1)).unwrap();
        assert!(ov.token("misc.test", 1).unwrap().is_some());

        assert!(ov.cancel("misc.test", 1).unwrap());
        assert!(ov.token("misc.test", 1).unwrap().is_none());
    }

    #[test]
    fn cache_evicts_oldest_entry_past_capacity() {
        let dir = tempdir().unwrap();
        let ov = Overview::open(dir.path().join("buffer"), 10, 2).unwrap();
        ov.group_add("misc.test").unwrap();
        for n in 1..=3u64 {
            ov.add("misc.test", sample_article(n)).unwrap();
            ov.token("misc.test", n).unwrap();
        }
        let mut cache = ov.cache.lock().unwrap();
        assert_eq!(cache.entries.len(), 2);
        assert!(!cache.entries.contains_key(&("misc.test".to_string(), 1)));
    }
}
