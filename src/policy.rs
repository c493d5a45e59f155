use crate::language::Response;

/// Server-wide limits checked against a crafted response before any byte of
/// it is written. Pure: same configuration and response always yield the
/// same decision.
#[derive(Debug, Clone, Copy)]
pub struct PolicyGate {
    pub sizelimit: Option<u64>,
    pub nohang: bool,
}

impl PolicyGate {
    /// `None` means accept; `Some(reason)` means the response must not be
    /// served. First violation wins.
    pub fn check(&self, response: &Response) -> Option<&'static str> {
        if let Some(limit) = self.sizelimit {
            if response.maximum_length() > limit {
                return Some("Response too large.");
            }
        }
        if self.nohang && response.actions.iter().any(|a| a.is_pause()) {
            return Some("Pauses have been disabled.");
        }
        None
    }
}
