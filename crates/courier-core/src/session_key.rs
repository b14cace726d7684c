//! Canonical session key resolution and parsing.
//!
//! A session key identifies one routable conversation context. Canonical
//! forms: `main`, `group:<id>`, `<surface>:group:<id>[:topic:<sub>]`,
//! `<surface>:dm:<peer>`, `agent:<agentId>:<rest>`. Parsing is total —
//! malformed input yields `None` and callers fall back to `main`.

use serde::{Deserialize, Serialize};

/// Granularity of direct-message session routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    /// All DMs from the owner collapse into the global `main` session.
    #[default]
    PerSender,
    /// One session per (channel, peer) pair; the same human on two
    /// platforms gets two independent sessions.
    PerChannelPeer,
    /// Everything routes to `main`.
    Global,
}

/// Routing components of an inbound event, as far as key resolution cares.
#[derive(Debug, Clone, Copy)]
pub struct MessageOrigin<'a> {
    pub channel: &'a str,
    pub account_id: Option<&'a str>,
    pub peer_id: &'a str,
    pub is_group: bool,
}

/// Structural kind of a parsed session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Main,
    Dm,
    Group,
    Agent,
}

/// A session key decomposed into routing components.
///
/// For `Agent` keys, `id` is the agent id and `subscope` holds the rest of
/// the key verbatim (it may itself contain colons).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSessionKey {
    pub surface: Option<String>,
    pub kind: KeyKind,
    pub id: String,
    pub subscope: Option<String>,
}

impl ParsedSessionKey {
    pub fn main() -> Self {
        Self {
            surface: None,
            kind: KeyKind::Main,
            id: String::new(),
            subscope: None,
        }
    }
}

/// Compute the canonical session key for an inbound event.
///
/// Group chats always get their own session regardless of scope — group
/// identity is unambiguous. DMs collapse according to `scope`; with the
/// default `PerSender` scope and a single configured account that is the
/// global `main` session.
pub fn resolve_session_key(origin: &MessageOrigin<'_>, scope: DmScope) -> String {
    if origin.is_group {
        let surface = normalize_surface(origin.channel);
        if surface.is_empty() {
            return format!("group:{}", origin.peer_id);
        }
        return format!("{surface}:group:{}", origin.peer_id);
    }
    match scope {
        DmScope::PerSender | DmScope::Global => "main".to_string(),
        DmScope::PerChannelPeer => {
            format!(
                "{}:dm:{}",
                normalize_surface(origin.channel),
                origin.peer_id
            )
        }
    }
}

/// Render a parsed key back into its canonical string form.
///
/// `format_session_key(parse_session_key(k)) == k` for every canonical key;
/// legacy aliases normalize.
pub fn format_session_key(parsed: &ParsedSessionKey) -> String {
    match parsed.kind {
        KeyKind::Main => "main".to_string(),
        KeyKind::Dm => match &parsed.surface {
            Some(s) => format!("{s}:dm:{}", parsed.id),
            None => format!("dm:{}", parsed.id),
        },
        KeyKind::Group => {
            let mut key = match &parsed.surface {
                Some(s) => format!("{s}:group:{}", parsed.id),
                None => format!("group:{}", parsed.id),
            };
            if let Some(sub) = &parsed.subscope {
                key.push_str(":topic:");
                key.push_str(sub);
            }
            key
        }
        KeyKind::Agent => match &parsed.subscope {
            Some(rest) => format!("agent:{}:{rest}", parsed.id),
            None => format!("agent:{}", parsed.id),
        },
    }
}

/// Parse a session key string. Total: returns `None` on malformed input,
/// never panics. Callers treat `None` as "fall back to `main`".
pub fn parse_session_key(key: &str) -> Option<ParsedSessionKey> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    if key == "main" {
        return Some(ParsedSessionKey::main());
    }

    let parts: Vec<&str> = key.split(':').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    // agent:<agentId>:<rest> — rest is kept verbatim (may contain colons).
    if parts[0] == "agent" {
        if parts.len() < 3 {
            return None;
        }
        return Some(ParsedSessionKey {
            surface: None,
            kind: KeyKind::Agent,
            id: parts[1].to_string(),
            subscope: Some(parts[2..].join(":")),
        });
    }

    // Unprefixed group/dm forms.
    if parts[0] == "group" || parts[0] == "dm" {
        return parse_scoped(None, &parts);
    }

    // Surface-prefixed forms, including legacy aliases (`tg:` == `telegram:`).
    let surface = normalize_surface(parts[0]);
    if parts.len() >= 2 && (parts[1] == "group" || parts[1] == "dm") {
        return parse_scoped(Some(surface), &parts[1..]);
    }

    // Legacy bare `<surface>:<peer>` DM form from older persisted stores.
    if parts.len() == 2 {
        return Some(ParsedSessionKey {
            surface: Some(surface),
            kind: KeyKind::Dm,
            id: parts[1].to_string(),
            subscope: None,
        });
    }

    None
}

fn parse_scoped(surface: Option<String>, parts: &[&str]) -> Option<ParsedSessionKey> {
    match parts[0] {
        "dm" if parts.len() == 2 => Some(ParsedSessionKey {
            surface,
            kind: KeyKind::Dm,
            id: parts[1].to_string(),
            subscope: None,
        }),
        "group" if parts.len() == 2 => Some(ParsedSessionKey {
            surface,
            kind: KeyKind::Group,
            id: parts[1].to_string(),
            subscope: None,
        }),
        "group" if parts.len() == 4 && parts[2] == "topic" => Some(ParsedSessionKey {
            surface,
            kind: KeyKind::Group,
            id: parts[1].to_string(),
            subscope: Some(parts[3].to_string()),
        }),
        _ => None,
    }
}

/// Map legacy channel aliases onto their canonical surface name.
fn normalize_surface(channel: &str) -> String {
    match channel {
        "tg" => "telegram".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm_origin<'a>(channel: &'a str, peer: &'a str) -> MessageOrigin<'a> {
        MessageOrigin {
            channel,
            account_id: None,
            peer_id: peer,
            is_group: false,
        }
    }

    #[test]
    fn per_sender_dm_resolves_to_main() {
        let key = resolve_session_key(&dm_origin("telegram", "12345"), DmScope::PerSender);
        assert_eq!(key, "main");
    }

    #[test]
    fn global_scope_resolves_to_main() {
        let key = resolve_session_key(&dm_origin("slack", "U99"), DmScope::Global);
        assert_eq!(key, "main");
    }

    #[test]
    fn per_channel_peer_embeds_channel_and_peer() {
        let key = resolve_session_key(&dm_origin("telegram", "12345"), DmScope::PerChannelPeer);
        assert_eq!(key, "telegram:dm:12345");
        let other = resolve_session_key(&dm_origin("discord", "12345"), DmScope::PerChannelPeer);
        assert_ne!(key, other, "same peer on two platforms gets two sessions");
    }

    #[test]
    fn group_always_gets_own_session_regardless_of_scope() {
        let origin = MessageOrigin {
            channel: "telegram",
            account_id: None,
            peer_id: "-100200",
            is_group: true,
        };
        for scope in [DmScope::PerSender, DmScope::PerChannelPeer, DmScope::Global] {
            assert_eq!(resolve_session_key(&origin, scope), "telegram:group:-100200");
        }
    }

    #[test]
    fn round_trip_canonical_keys() {
        let keys = [
            "main",
            "group:42",
            "telegram:group:-100123",
            "telegram:group:-100123:topic:77",
            "discord:dm:user9",
            "dm:peer1",
            "agent:researcher:telegram:group:5",
            "agent:ops:main",
        ];
        for key in keys {
            let parsed = parse_session_key(key)
                .unwrap_or_else(|| panic!("'{key}' should parse"));
            assert_eq!(format_session_key(&parsed), key, "round-trip of '{key}'");
        }
    }

    #[test]
    fn parse_is_total_on_malformed_input() {
        for bad in [
            "",
            "   ",
            ":",
            "group:",
            ":group:1",
            "telegram:group:",
            "telegram:group:1:topic:",
            "telegram:group:1:banana:2",
            "agent:",
            "agent:solo",
            "a:b:c:d",
        ] {
            assert_eq!(parse_session_key(bad), None, "'{bad}' must not parse");
        }
    }

    #[test]
    fn legacy_tg_prefix_parses_and_normalizes() {
        let parsed = parse_session_key("tg:group:5").expect("legacy group key parses");
        assert_eq!(parsed.surface.as_deref(), Some("telegram"));
        assert_eq!(format_session_key(&parsed), "telegram:group:5");

        let bare = parse_session_key("tg:12345").expect("legacy bare dm key parses");
        assert_eq!(bare.kind, KeyKind::Dm);
        assert_eq!(bare.id, "12345");
        assert_eq!(format_session_key(&bare), "telegram:dm:12345");
    }

    #[test]
    fn agent_rest_keeps_embedded_colons() {
        let parsed = parse_session_key("agent:helper:slack:group:C1:topic:9").unwrap();
        assert_eq!(parsed.kind, KeyKind::Agent);
        assert_eq!(parsed.id, "helper");
        assert_eq!(parsed.subscope.as_deref(), Some("slack:group:C1:topic:9"));
    }

    #[test]
    fn surface_is_case_insensitive() {
        let parsed = parse_session_key("Telegram:group:5").unwrap();
        assert_eq!(parsed.surface.as_deref(), Some("telegram"));
    }
}
