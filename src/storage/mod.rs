//! C2: the storage manager. Dispatches `store`/`retrieve`/`cancel`/`next`
//! to a backend chosen by the token's first byte; backends are registered
//! in a capability table at startup (§9 "Dynamic dispatch": no inheritance,
//! just a table keyed by `u8`).

mod timehash;

pub use timehash::TimehashBackend;

use std::collections::HashMap;

use crate::error::Error;
use crate::token::Token;

/// What portion of an article a retrieve should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveWhat {
    Head,
    Body,
    All,
    Stat,
}

/// An article in wire format, split at the header/body boundary so callers
/// that asked for `Head` or `Body` don't pay for a copy of the other half.
#[derive(Debug, Clone)]
pub struct Article {
    pub data: Vec<u8>,
    pub arrived: i64,
}

/// A backend-specific side-channel answer, e.g. "what group/article-number
/// is this token filed under".
#[derive(Debug, Clone)]
pub enum Answer {
    GroupArticleNumber { group: String, number: u64 },
    None,
}

/// A backend-specific probe question.
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    GroupArticleNumber,
}

/// The operation set every storage backend implements. `backend_id`
/// identifies which byte of the token dispatches to this implementation.
pub trait StorageBackend: Send + Sync {
    fn backend_id(&self) -> u8;

    fn store(&self, article: &[u8], class: u8, arrived: i64) -> Result<Token, Error>;

    fn retrieve(&self, token: Token, what: RetrieveWhat) -> Result<Article, Error>;

    fn cancel(&self, token: Token) -> Result<(), Error>;

    /// Enumerates stored articles. `cursor` is an opaque, backend-defined
    /// resumption token; `None` starts a fresh walk. Order is
    /// backend-defined and not guaranteed stable across concurrent writes.
    fn next(&self, cursor: Option<Vec<u8>>) -> Result<Option<(Token, Vec<u8>)>, Error>;

    fn probe(&self, token: Token, question: Probe) -> Result<Answer, Error> {
        let _ = (token, question);
        Ok(Answer::None)
    }
}

/// Dispatches operations to the registered backend for a token's first
/// byte. Construction loads backends per configuration; lookups after that
/// are an O(1) table index.
pub struct StorageManager {
    backends: HashMap<u8, Box<dyn StorageBackend>>,
}

impl StorageManager {
    pub fn new() -> Self {
        StorageManager { backends: HashMap::new() }
    }

    pub fn register(&mut self, backend: Box<dyn StorageBackend>) {
        self.backends.insert(backend.backend_id(), backend);
    }

    fn backend_for(&self, id: u8) -> Result<&dyn StorageBackend, Error> {
        self.backends
            .get(&id)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::internal(format!("storage backend {} not initialized", id)))
    }

    pub fn store(&self, backend_id: u8, article: &[u8], class: u8, arrived: i64) -> Result<Token, Error> {
        self.backend_for(backend_id)?.store(article, class, arrived)
    }

    pub fn retrieve(&self, token: Token, what: RetrieveWhat) -> Result<Article, Error> {
        if token.is_null() {
            return Err(Error::NotFound);
        }
        self.backend_for(token.backend)?.retrieve(token, what)
    }

    pub fn cancel(&self, token: Token) -> Result<(), Error> {
        if token.is_null() {
            return Err(Error::NotFound);
        }
        self.backend_for(token.backend)?.cancel(token)
    }

    pub fn probe(&self, token: Token, question: Probe) -> Result<Answer, Error> {
        self.backend_for(token.backend)?.probe(token, question)
    }
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dispatch_reaches_the_registered_backend() {
        let dir = tempdir().unwrap();
        let mut sm = StorageManager::new();
        sm.register(Box::new(TimehashBackend::new(dir.path().to_path_buf())));

        let article = b"Message-ID: <a@b>\r\nNewsgroups: misc.test\r\n\r\nbody\r\n";
        let token = sm.store(TimehashBackend::ID, article, 0x41, 1_000).unwrap();
        assert_eq!(token.backend, TimehashBackend::ID);

        let fetched = sm.retrieve(token, RetrieveWhat::All).unwrap();
        assert_eq!(fetched.data, article);
    }

    #[test]
    fn unregistered_backend_is_uninit() {
        let sm = StorageManager::new();
        let token = Token::new(0x99, 0, [0; 16]);
        let err = sm.retrieve(token, RetrieveWhat::All).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
