use std::fmt;

/// Maximum redirects followed for one caller message.
pub const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// The slot moved for good.
    Moved,
    /// One-off redirect during a migration.
    Ask,
}

impl RedirectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectKind::Moved => "moved",
            RedirectKind::Ask => "ask",
        }
    }
}

/// A parsed `-MOVED <slot> <host:port>` or `-ASK <slot> <host:port>` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub endpoint: String,
}

impl Redirect {
    pub fn parse(error: &[u8]) -> Option<Redirect> {
        let text = std::str::from_utf8(error).ok()?;
        let mut parts = text.split_ascii_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let slot = parts.next()?.parse::<u16>().ok()?;
        if slot >= crate::utils::SLOT_COUNT {
            return None;
        }
        let endpoint = parts.next()?;
        if parts.next().is_some() || !endpoint.contains(':') {
            return None;
        }
        Some(Redirect {
            kind,
            slot,
            endpoint: endpoint.to_string(),
        })
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind.as_str(), self.slot, self.endpoint)
    }
}
