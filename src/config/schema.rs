//! The semantic layer on top of the raw parse tree: a typed schema that
//! validates each parameter's value and reports unknown keys, matching the
//! "unknown keys are a warning in permissive mode and an error in strict
//! check mode" rule.

use anyhow::{bail, Error};

use super::parser::{ConfigGroup, ConfigValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Integer,
    String,
    List,
}

#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub name: &'static str,
    pub kind: ParamKind,
}

pub const fn param(name: &'static str, kind: ParamKind) -> ParamSchema {
    ParamSchema { name, kind }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Permissive,
    Strict,
}

/// Validates `group`'s parameters against `schema`, checking value kinds
/// and flagging unknown keys according to `mode`.
pub fn validate(group: &ConfigGroup, schema: &[ParamSchema], mode: CheckMode) -> Result<(), Error> {
    for (key, value) in &group.params {
        match schema.iter().find(|p| p.name == key) {
            None => {
                let msg = format!("unknown configuration key {:?}", key);
                match mode {
                    CheckMode::Permissive => log::warn!("{}", msg),
                    CheckMode::Strict => bail!("{}", msg),
                }
            }
            Some(p) => {
                if !kind_matches(p.kind, value) {
                    bail!("key {:?} has the wrong type (expected {:?})", key, p.kind);
                }
            }
        }
    }
    Ok(())
}

fn kind_matches(kind: ParamKind, value: &ConfigValue) -> bool {
    match (kind, value) {
        (ParamKind::Bool, ConfigValue::Bool(_)) => true,
        (ParamKind::Integer, ConfigValue::Integer(_)) => true,
        (ParamKind::String, ConfigValue::String(_)) => true,
        (ParamKind::List, ConfigValue::List(_)) => true,
        _ => false,
    }
}
