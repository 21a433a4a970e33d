//! Inbound URL validation shared by the public create/patch handlers.

const ACCEPTED_HOSTS: &[&str] = &["www.youtube.com", "youtube.com", "m.youtube.com"];

/// Accepts only the canonical `https://www.youtube.com/watch?v=<id>` shape
/// (and its bare/mobile host variants); rejects short links like
/// `https://youtu.be/<id>` per scenario S4.
pub fn is_valid_stream_url(s: &str) -> bool {
    let Ok(url) = url::Url::parse(s) else { return false };
    if url.scheme() != "https" {
        return false;
    }
    let Some(host) = url.host_str() else { return false };
    if !ACCEPTED_HOSTS.contains(&host) {
        return false;
    }
    if url.path() != "/watch" {
        return false;
    }
    url.query_pairs().any(|(k, v)| k == "v" && !v.is_empty())
}

pub fn is_absolute_http_url(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| u.scheme() == "http" || u.scheme() == "https")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_watch_url() {
        assert!(is_valid_stream_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
    }

    #[test]
    fn rejects_short_link() {
        assert!(!is_valid_stream_url("https://youtu.be/abc"));
    }

    #[test]
    fn rejects_missing_video_id() {
        assert!(!is_valid_stream_url("https://www.youtube.com/watch"));
    }

    #[test]
    fn rejects_non_youtube_host() {
        assert!(!is_valid_stream_url("https://example.com/watch?v=abc"));
    }
}
