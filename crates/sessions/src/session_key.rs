//! Canonical session keys.
//!
//! Key templates:
//! - `channel_peer:<channel>:<account>:<kind>:<peer>`           (kind = dm | group | channel)
//! - `channel_peer:<channel>:<account>:<kind>:<peer>:<thread>`  (threaded variant)
//! - `agent_main:<agent_id>`                                    (standalone, non-channel)
//!
//! Parsing never fails: a string that matches neither template parses to
//! [`ParsedSessionKey::Opaque`] carrying the raw input. Equality between
//! keys is byte-equality on the canonical string; the parsed fields are the
//! authoritative routing identity.

use courier_domain::payload::PeerKind;

const CHANNEL_PEER_PREFIX: &str = "channel_peer:";
const AGENT_MAIN_PREFIX: &str = "agent_main:";

/// Structured view of a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSessionKey {
    ChannelPeer {
        channel_id: String,
        account_id: String,
        peer_kind: PeerKind,
        peer_id: String,
        thread_id: Option<String>,
    },
    AgentMain {
        agent_id: String,
    },
    Opaque {
        raw: String,
    },
}

impl ParsedSessionKey {
    pub fn is_opaque(&self) -> bool {
        matches!(self, ParsedSessionKey::Opaque { .. })
    }
}

/// Parse a session key. Never fails; unknown shapes come back opaque.
pub fn parse(s: &str) -> ParsedSessionKey {
    if let Some(rest) = s.strip_prefix(AGENT_MAIN_PREFIX) {
        if !rest.is_empty() {
            return ParsedSessionKey::AgentMain {
                agent_id: rest.to_owned(),
            };
        }
        return opaque(s);
    }

    let Some(rest) = s.strip_prefix(CHANNEL_PEER_PREFIX) else {
        return opaque(s);
    };

    let parts: Vec<&str> = rest.split(':').collect();
    if !(parts.len() == 4 || parts.len() == 5) || parts.iter().any(|p| p.is_empty()) {
        return opaque(s);
    }
    let Some(peer_kind) = PeerKind::parse(parts[2]) else {
        return opaque(s);
    };

    ParsedSessionKey::ChannelPeer {
        channel_id: parts[0].to_owned(),
        account_id: parts[1].to_owned(),
        peer_kind,
        peer_id: parts[3].to_owned(),
        thread_id: parts.get(4).map(|t| (*t).to_owned()),
    }
}

/// Build the canonical channel-peer key.
pub fn make_channel_peer(
    channel: &str,
    account: &str,
    kind: PeerKind,
    peer: &str,
    thread: Option<&str>,
) -> String {
    let base = format!(
        "{CHANNEL_PEER_PREFIX}{channel}:{account}:{}:{peer}",
        kind.as_str()
    );
    match thread {
        Some(t) if !t.is_empty() => format!("{base}:{t}"),
        _ => base,
    }
}

/// The agent owning a key: explicit for `agent_main:*`, `default` for
/// everything else.
pub fn agent_id_of(key: &str) -> String {
    match parse(key) {
        ParsedSessionKey::AgentMain { agent_id } => agent_id,
        _ => "default".to_owned(),
    }
}

/// Whether the key parses to a recognized shape.
pub fn is_valid(key: &str) -> bool {
    !parse(key).is_opaque()
}

fn opaque(s: &str) -> ParsedSessionKey {
    ParsedSessionKey::Opaque { raw: s.to_owned() }
}
