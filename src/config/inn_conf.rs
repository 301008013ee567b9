//! `inn.conf`: the typed configuration struct every module reads through
//! [`crate::context::SystemContext`], built from the raw parse tree of
//! [`super::parser`] via the schema layer.

use std::path::PathBuf;

use anyhow::Error;

use super::parser::{parse_str, ConfigValue};
use super::schema::{param, validate, CheckMode, ParamKind, ParamSchema};

const SCHEMA: &[ParamSchema] = &[
    param("patharticles", ParamKind::String),
    param("pathoverview", ParamKind::String),
    param("pathdb", ParamKind::String),
    param("pathtmp", ParamKind::String),
    param("articlemmap", ParamKind::Bool),
    param("overcachesize", ParamKind::Integer),
    param("icdsynccount", ParamKind::Integer),
    param("dbzincore", ParamKind::Bool),
    param("dbzsync", ParamKind::Bool),
    param("maxartsize", ParamKind::Integer),
];

/// Strongly typed view of `inn.conf`. Every field has the same default the
/// original distribution ships, so a minimal or empty file still produces a
/// working configuration.
#[derive(Debug, Clone)]
pub struct InnConf {
    pub patharticles: PathBuf,
    pub pathoverview: PathBuf,
    pub pathdb: PathBuf,
    pub pathtmp: PathBuf,
    pub articlemmap: bool,
    pub overcachesize: usize,
    pub icdsynccount: u32,
    pub dbzincore: bool,
    pub dbzsync: bool,
    pub maxartsize: u64,
}

impl Default for InnConf {
    fn default() -> Self {
        InnConf {
            patharticles: PathBuf::from("/var/spool/news/articles"),
            pathoverview: PathBuf::from("/var/spool/news/overview"),
            pathdb: PathBuf::from("/var/spool/news/db"),
            pathtmp: PathBuf::from("/var/spool/news/tmp"),
            articlemmap: true,
            overcachesize: 1024,
            icdsynccount: 10,
            dbzincore: true,
            dbzsync: true,
            maxartsize: 1_000_000,
        }
    }
}

impl InnConf {
    /// Parses and validates `text`, overlaying recognized keys onto the
    /// defaults. Unknown keys are handled per `mode`; a malformed value for
    /// a known key is always an error (configuration loading failures are
    /// fatal to startup, never a warning).
    pub fn parse(text: &str, mode: CheckMode) -> Result<Self, Error> {
        let group = parse_str(text).map_err(|e| anyhow::anyhow!("{}", e))?;
        validate(&group, SCHEMA, mode)?;

        let mut conf = InnConf::default();
        if let Some(v) = group.get("patharticles").and_then(ConfigValue::as_str) {
            conf.patharticles = PathBuf::from(v);
        }
        if let Some(v) = group.get("pathoverview").and_then(ConfigValue::as_str) {
            conf.pathoverview = PathBuf::from(v);
        }
        if let Some(v) = group.get("pathdb").and_then(ConfigValue::as_str) {
            conf.pathdb = PathBuf::from(v);
        }
        if let Some(v) = group.get("pathtmp").and_then(ConfigValue::as_str) {
            conf.pathtmp = PathBuf::from(v);
        }
        if let Some(v) = group.get("articlemmap").and_then(ConfigValue::as_bool) {
            conf.articlemmap = v;
        }
        if let Some(v) = group.get("overcachesize").and_then(ConfigValue::as_integer) {
            conf.overcachesize = v.max(0) as usize;
        }
        if let Some(v) = group.get("icdsynccount").and_then(ConfigValue::as_integer) {
            conf.icdsynccount = v.max(1) as u32;
        }
        if let Some(v) = group.get("dbzincore").and_then(ConfigValue::as_bool) {
            conf.dbzincore = v;
        }
        if let Some(v) = group.get("dbzsync").and_then(ConfigValue::as_bool) {
            conf.dbzsync = v;
        }
        if let Some(v) = group.get("maxartsize").and_then(ConfigValue::as_integer) {
            conf.maxartsize = v.max(0) as u64;
        }

        // The system initializer exports TMPDIR from pathtmp so that any
        // child helper program inherits the same scratch directory.
        std::env::set_var("TMPDIR", &conf.pathtmp);

        Ok(conf)
    }

    pub fn load(path: &std::path::Path, mode: CheckMode) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_empty() {
        let conf = InnConf::parse("", CheckMode::Permissive).unwrap();
        assert_eq!(conf.overcachesize, 1024);
    }

    #[test]
    fn overrides_known_keys() {
        let conf = InnConf::parse("overcachesize: 42\narticlemmap: no\n", CheckMode::Permissive).unwrap();
        assert_eq!(conf.overcachesize, 42);
        assert!(!conf.articlemmap);
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let err = InnConf::parse("bogus: yes\n", CheckMode::Strict);
        assert!(err.is_err());
    }
}
