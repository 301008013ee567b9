//! `inn-secrets.conf`: the `cancels` group feeding [`crate::canlock`].

use anyhow::{anyhow, Error};

use super::parser::parse_str;

/// Two ordered lists of opaque secret strings. Order matters only for
/// rotation (newest first). Either list may be empty, which disables
/// Cancel-Lock generation for that mode without being an error.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub canlockadmin: Vec<String>,
    pub canlockuser: Vec<String>,
}

impl Secrets {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let root = parse_str(text).map_err(|e| anyhow!("{}", e))?;
        let cancels = root
            .children
            .iter()
            .find(|g| g.group_type == "cancels");

        let cancels = match cancels {
            Some(g) => g,
            None => return Ok(Secrets::default()),
        };

        let canlockadmin = cancels
            .get("canlockadmin")
            .and_then(|v| v.as_list())
            .map(|items| items.to_vec())
            .unwrap_or_default();
        let canlockuser = cancels
            .get("canlockuser")
            .and_then(|v| v.as_list())
            .map(|items| items.to_vec())
            .unwrap_or_default();

        Ok(Secrets { canlockadmin, canlockuser })
    }

    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cancels_group_yields_empty_secrets() {
        let s = Secrets::parse("").unwrap();
        assert!(s.canlockadmin.is_empty());
        assert!(s.canlockuser.is_empty());
    }

    #[test]
    fn parses_both_lists() {
        let src = r#"
            cancels {
                canlockadmin: ["ExampleSecret"];
                canlockuser: ["AnotherSecret"];
            }
        "#;
        let s = Secrets::parse(src).unwrap();
        assert_eq!(s.canlockadmin, vec!["ExampleSecret".to_string()]);
        assert_eq!(s.canlockuser, vec!["AnotherSecret".to_string()]);
    }
}
