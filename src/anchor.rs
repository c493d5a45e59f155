use eyre::{WrapErr, eyre};
use regex::Regex;

use crate::config::RequestSettings;
use crate::language;

/// Ordered `(pattern, specification)` pairs matched against request paths
/// before the generic crafting path. Every pattern and specification is
/// validated at construction; anchors are static, so a bad entry is fatal.
pub struct AnchorTable {
    entries: Vec<(Regex, String)>,
}

impl AnchorTable {
    pub fn compile(
        anchors: &[(String, String)],
        settings: &RequestSettings,
    ) -> eyre::Result<Self> {
        let mut entries = Vec::with_capacity(anchors.len());
        for (pattern, spec) in anchors {
            let regex = Regex::new(pattern)
                .wrap_err_with(|| format!("invalid regex in anchor: {pattern}"))?;
            language::parse_response(settings, spec)
                .map_err(|err| eyre!("invalid response spec in anchor {spec:?}: {err}"))?;
            entries.push((regex, spec.clone()));
        }
        Ok(AnchorTable { entries })
    }

    /// First configured entry whose pattern matches wins
    pub fn matching(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(regex, _)| regex.is_match(path))
            .map(|(_, spec)| spec.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
