use uuid::Uuid;

/// Cookie correlating successive turns to one upstream conversation.
pub const SESSION_COOKIE: &str = "chat_session_id";

/// Two weeks, in seconds.
pub const SESSION_MAX_AGE_SECS: u64 = 14 * 24 * 60 * 60;

/// Prefix for freshly minted session identifiers.
const SESSION_PREFIX: &str = "chat-";

/// Resolve the conversation session id for a request: an existing non-empty
/// cookie value passes through untouched (it is an opaque upstream key, not
/// validated here), otherwise a fresh id is minted.
pub fn resolve_session(existing: Option<&str>) -> String {
    match existing {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => format!("{}{}", SESSION_PREFIX, Uuid::new_v4()),
    }
}

/// Pull the named cookie's value out of a raw `Cookie:` header.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k.trim() == name {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// Render the `Set-Cookie` value that re-plants the session id. Sent on every
/// response that has a resolvable session, error paths included, so a retried
/// request keeps its upstream conversation.
pub fn set_cookie_value(session_id: &str) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; SameSite=Lax",
        SESSION_COOKIE, session_id, SESSION_MAX_AGE_SECS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_session_passes_existing_through() {
        assert_eq!(resolve_session(Some("chat-abc")), "chat-abc");
        // Opaque key: format is not validated.
        assert_eq!(resolve_session(Some("legacy-id-7")), "legacy-id-7");
    }

    #[test]
    fn test_resolve_session_mints_when_missing() {
        let id = resolve_session(None);
        assert!(id.starts_with("chat-"));
        assert!(id.len() > "chat-".len());
    }

    #[test]
    fn test_resolve_session_mints_when_empty() {
        let id = resolve_session(Some(""));
        assert!(id.starts_with("chat-"));
    }

    #[test]
    fn test_minted_ids_are_unique() {
        let a = resolve_session(None);
        let b = resolve_session(None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_minted_suffix_is_a_uuid() {
        let id = resolve_session(None);
        let suffix = id.strip_prefix("chat-").expect("prefix");
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[test]
    fn test_cookie_value_found() {
        let header = "theme=dark; chat_session_id=chat-123; lang=es";
        assert_eq!(cookie_value(header, SESSION_COOKIE), Some("chat-123"));
    }

    #[test]
    fn test_cookie_value_handles_spacing() {
        assert_eq!(
            cookie_value("chat_session_id = chat-9 ", SESSION_COOKIE),
            Some("chat-9")
        );
    }

    #[test]
    fn test_cookie_value_absent() {
        assert_eq!(cookie_value("theme=dark", SESSION_COOKIE), None);
        assert_eq!(cookie_value("", SESSION_COOKIE), None);
    }

    #[test]
    fn test_cookie_value_ignores_name_suffix_collisions() {
        assert_eq!(
            cookie_value("xchat_session_id=no; chat_session_id=yes", SESSION_COOKIE),
            Some("yes")
        );
    }

    #[test]
    fn test_set_cookie_attributes() {
        let v = set_cookie_value("chat-42");
        assert_eq!(
            v,
            "chat_session_id=chat-42; Path=/; Max-Age=1209600; SameSite=Lax"
        );
    }

    #[test]
    fn test_session_continuity_round_trip() {
        // A request with no cookie mints an id; presenting that id back
        // yields the same id again.
        let minted = resolve_session(None);
        let header = format!("{}={}", SESSION_COOKIE, minted);
        let echoed = cookie_value(&header, SESSION_COOKIE);
        assert_eq!(resolve_session(echoed), minted);
    }
}
