//! C3: one article per file under `spool/time-CC/hh/hh/ssss-TTTT`, bucketed
//! by arrival time. Grounded directly on the original `timehash.c`: the
//! path layout, the `O_CREAT|O_EXCL` collision loop, and the four-level
//! directory walk used by `next` are carried over unchanged in spirit.

use std::convert::TryInto;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use super::{Answer, Article, Probe, RetrieveWhat, StorageBackend};
use crate::error::Error;
use crate::token::Token;

/// Matches a stored article's path relative to the spool root:
/// `time-CC/hh/hh/ssss-TTTT`, all fields uppercase hex.
static ARTICLE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^time-[0-9A-F]{2}/[0-9A-F]{2}/[0-9A-F]{2}/[0-9A-F]{4}-[0-9A-F]{4}$").unwrap());

/// Article headers/body are separated by the first bare CRLF CRLF.
fn find_body(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

pub struct TimehashBackend {
    root: PathBuf,
    /// Process-local sequence counter, wrapping mod 2^16 as in the source;
    /// the real collision guard is the filesystem's `O_CREAT|O_EXCL`, this
    /// just avoids starting the search at zero every time.
    seq: AtomicU16,
    /// Directory walk state for `next` serialized behind a mutex so callers
    /// can interleave with concurrent stores without racing each other's
    /// cursor.
    walk: Mutex<()>,
}

impl TimehashBackend {
    pub const ID: u8 = 1;

    pub fn new(root: PathBuf) -> Self {
        TimehashBackend { root, seq: AtomicU16::new(0), walk: Mutex::new(()) }
    }

    fn make_path(&self, arrived: u32, seqnum: u16, class: u8) -> PathBuf {
        let hh1 = (arrived >> 24) & 0xff;
        let hh2 = (arrived >> 16) & 0xff;
        let ttt = arrived & 0xffff;
        self.root
            .join(format!("time-{:02X}", class))
            .join(format!("{:02X}", hh1))
            .join(format!("{:02X}", hh2))
            .join(format!("{:04X}-{:04X}", seqnum, ttt))
    }

    fn path_for_token(&self, token: Token) -> PathBuf {
        let (arrived, seqnum) = break_token(token);
        self.make_path(arrived, seqnum, token.class)
    }
}

fn make_token(arrived: u32, seqnum: u16, class: u8) -> Token {
    let mut payload = [0u8; 16];
    payload[0..4].copy_from_slice(&arrived.to_be_bytes());
    payload[4..6].copy_from_slice(&seqnum.to_be_bytes());
    Token::new(TimehashBackend::ID, class, payload)
}

fn rel_path_for_token(token: Token) -> String {
    let (arrived, seqnum) = break_token(token);
    let hh1 = (arrived >> 24) & 0xff;
    let hh2 = (arrived >> 16) & 0xff;
    let ttt = arrived & 0xffff;
    format!(
        "time-{:02X}/{:02X}/{:02X}/{:04X}-{:04X}",
        token.class, hh1, hh2, seqnum, ttt
    )
}

fn break_token(token: Token) -> (u32, u16) {
    let arrived = u32::from_be_bytes(token.payload[0..4].try_into().unwrap());
    let seqnum = u16::from_be_bytes(token.payload[4..6].try_into().unwrap());
    (arrived, seqnum)
}

impl StorageBackend for TimehashBackend {
    fn backend_id(&self) -> u8 {
        Self::ID
    }

    fn store(&self, article: &[u8], class: u8, arrived: i64) -> Result<Token, Error> {
        let arrived = arrived as u32;
        let start_seq = self.seq.fetch_add(1, Ordering::Relaxed);

        for attempt in 0u32..=(u16::MAX as u32) {
            let seqnum = start_seq.wrapping_add(attempt as u16);
            let path = self.make_path(arrived, seqnum, class);

            match OpenOptions::new().write(true).create_new(true).mode(0o640).open(&path) {
                Ok(mut file) => {
                    if let Err(err) = file.write_all(article) {
                        let _ = fs::remove_file(&path);
                        return Err(Error::Io(err));
                    }
                    return Ok(make_token(arrived, seqnum, class));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    continue;
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }

        Err(Error::internal("timehash: exhausted sequence numbers for this timestamp"))
    }

    fn retrieve(&self, token: Token, what: RetrieveWhat) -> Result<Article, Error> {
        if token.backend != Self::ID {
            return Err(Error::internal("wrong backend for token"));
        }
        let (arrived, _) = break_token(token);
        let path = self.path_for_token(token);

        let mut file = File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(err)
            }
        })?;

        if what == RetrieveWhat::Stat {
            return Ok(Article { data: Vec::new(), arrived: arrived as i64 });
        }

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(Error::Io)?;

        let data = match what {
            RetrieveWhat::All => buf,
            RetrieveWhat::Head => {
                let split = find_body(&buf).ok_or(Error::NoSpace("no body separator".into()))?;
                buf[..split].to_vec()
            }
            RetrieveWhat::Body => {
                let split = find_body(&buf).ok_or_else(|| Error::internal("article has no body"))?;
                buf[split..].to_vec()
            }
            RetrieveWhat::Stat => unreachable!(),
        };

        Ok(Article { data, arrived: arrived as i64 })
    }

    fn cancel(&self, token: Token) -> Result<(), Error> {
        let path = self.path_for_token(token);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn next(&self, cursor: Option<Vec<u8>>) -> Result<Option<(Token, Vec<u8>)>, Error> {
        let _guard = self.walk.lock().unwrap();

        // The cursor is the 18 raw bytes of the previously returned token;
        // we re-derive its path to know where in lexical order to resume.
        let start_after = match cursor {
            None => None,
            Some(bytes) if bytes.len() == 18 => {
                let mut payload = [0u8; 16];
                payload.copy_from_slice(&bytes[2..18]);
                let token = Token::new(bytes[0], bytes[1], payload);
                Some(rel_path_for_token(token))
            }
            Some(_) => return Err(Error::internal("malformed next() cursor")),
        };

        let mut entries = Vec::new();
        collect_article_paths(&self.root, &mut entries)?;
        entries.sort();

        let next_rel = match &start_after {
            None => entries.into_iter().next(),
            Some(after) => entries.into_iter().find(|p| p.as_str() > after.as_str()),
        };

        let rel = match next_rel {
            Some(r) => r,
            None => return Ok(None),
        };

        let token = path_to_token(&rel).ok_or_else(|| Error::internal("malformed spool path"))?;
        let data = fs::read(self.root.join(&rel)).map_err(Error::Io)?;
        Ok(Some((token, data)))
    }

    fn probe(&self, _token: Token, _question: Probe) -> Result<Answer, Error> {
        Ok(Answer::None)
    }
}

/// Walks the `time-CC/hh/hh/XXXX-XXXX` tree four levels deep, skipping
/// anything that doesn't match [`ARTICLE_PATH`] (tolerant to foreign files,
/// mirroring `FindDir`'s strict length+hex-digit checks in the original).
fn collect_article_paths(root: &Path, out: &mut Vec<String>) -> Result<(), Error> {
    if !root.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(root).min_depth(4).max_depth(4).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let rel = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect::<Vec<_>>().join("/");
        if ARTICLE_PATH.is_match(&rel) {
            out.push(rel);
        }
    }
    Ok(())
}

fn path_to_token(rel: &str) -> Option<Token> {
    let mut parts = rel.split('/');
    let topdir = parts.next()?;
    let sec = parts.next()?;
    let ter = parts.next()?;
    let file = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let class = u8::from_str_radix(&topdir[5..7], 16).ok()?;
    let hh1 = u32::from_str_radix(sec, 16).ok()?;
    let hh2 = u32::from_str_radix(ter, 16).ok()?;
    let seqnum = u16::from_str_radix(&file[0..4], 16).ok()?;
    let ttt = u32::from_str_radix(&file[5..9], 16).ok()?;
    let arrived = (hh1 << 24) | (hh2 << 16) | ttt;
    Some(make_token(arrived, seqnum, class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend() -> (tempfile::TempDir, TimehashBackend) {
        let dir = tempdir().unwrap();
        let backend = TimehashBackend::new(dir.path().to_path_buf());
        (dir, backend)
    }

    #[test]
    fn store_then_retrieve_round_trips_bytes() {
        let (_dir, backend) = backend();
        let article = b"Message-ID: <a@b>\r\nNewsgroups: misc.test\r\n\r\nbody text\r\n".to_vec();
        let token = backend.store(&article, 0x41, 1_700_000_000).unwrap();
        assert_eq!(token.class, 0x41);
        let fetched = backend.retrieve(token, RetrieveWhat::All).unwrap();
        assert_eq!(fetched.data, article);
    }

    #[test]
    fn head_and_body_split_at_blank_line() {
        let (_dir, backend) = backend();
        let article = b"Subject: x\r\n\r\nbody\r\n".to_vec();
        let token = backend.store(&article, 0, 1).unwrap();
        let head = backend.retrieve(token, RetrieveWhat::Head).unwrap();
        let body = backend.retrieve(token, RetrieveWhat::Body).unwrap();
        assert_eq!(head.data, b"Subject: x\r\n\r\n");
        assert_eq!(body.data, b"body\r\n");
    }

    #[test]
    fn cancel_then_retrieve_is_not_found() {
        let (_dir, backend) = backend();
        let token = backend.store(b"Subject: x\r\n\r\nbody\r\n", 0, 1).unwrap();
        backend.cancel(token).unwrap();
        let err = backend.retrieve(token, RetrieveWhat::All).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn cancel_of_missing_token_is_not_found_not_an_error() {
        let (_dir, backend) = backend();
        let token = make_token(1, 0, 0);
        let err = backend.cancel(token).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn concurrent_stores_at_the_same_second_get_distinct_sequence_numbers() {
        let (_dir, backend) = backend();
        let a = backend.store(b"A\r\n\r\n", 0, 5).unwrap();
        let b = backend.store(b"B\r\n\r\n", 0, 5).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn next_walks_every_stored_article_tolerating_foreign_files() {
        let (dir, backend) = backend();
        let t1 = backend.store(b"one\r\n\r\n", 0, 10).unwrap();
        let t2 = backend.store(b"two\r\n\r\n", 0, 11).unwrap();

        // A foreign file dropped into the tree should be skipped.
        std::fs::write(dir.path().join("time-00").join("stray.tmp"), b"noise").ok();

        let mut seen = std::collections::HashSet::new();
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            match backend.next(cursor.clone()).unwrap() {
                None => break,
                Some((token, _data)) => {
                    seen.insert(token);
                    let mut bytes = vec![token.backend, token.class];
                    bytes.extend_from_slice(&token.payload);
                    cursor = Some(bytes);
                }
            }
        }
        assert!(seen.contains(&t1));
        assert!(seen.contains(&t2));
    }
}
