//! Configuration: the block-structured parser (C10), its typed schema
//! layer, and the two concrete config surfaces the rest of the crate reads
//! from, `inn.conf` and `inn-secrets.conf`.

mod inn_conf;
mod parser;
mod schema;
mod secrets;

pub use inn_conf::InnConf;
pub use parser::{ConfigGroup, ConfigValue, ParseError};
pub use schema::{CheckMode, ParamKind, ParamSchema};
pub use secrets::Secrets;
