//! Classifies response bodies so the recorder can pick a representation:
//! inline text, inline binary, or an external object-store reference.

/// Media type prefixes that always denote a streamed body.
const STREAM_PREFIXES: &[&str] = &[
    "text/event-stream",
    "application/x-ndjson",
    "application/stream+json",
];

const BINARY_PREFIXES: &[&str] = &[
    "image/",
    "video/",
    "audio/",
    "font/",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-tar",
    "application/octet-stream",
    "application/msword",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument",
];

const TEXT_PREFIXES: &[&str] = &[
    "text/",
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-www-form-urlencoded",
    "application/graphql",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Text,
    Binary,
    Stream,
}

/// Classify a body from its declared media type, falling back to a byte
/// heuristic when the type is unknown or absent.
///
/// The declared type wins whenever it matches a known prefix, so an
/// `text/event-stream` response is a stream no matter what the payload
/// looks like.
pub fn classify(media_type: Option<&str>, body: &[u8]) -> BodyKind {
    if let Some(media_type) = media_type {
        let essence = media_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        if STREAM_PREFIXES.iter().any(|p| essence.starts_with(p)) {
            return BodyKind::Stream;
        }
        if BINARY_PREFIXES.iter().any(|p| essence.starts_with(p)) {
            return BodyKind::Binary;
        }
        if TEXT_PREFIXES.iter().any(|p| essence.starts_with(p)) {
            return BodyKind::Text;
        }
    }

    if looks_binary(body) {
        BodyKind::Binary
    } else {
        BodyKind::Text
    }
}

/// NUL anywhere, or more than 30% of the first 1000 bytes outside
/// printable ASCII (allowing HT/LF/CR).
fn looks_binary(body: &[u8]) -> bool {
    if body.contains(&0) {
        return true;
    }

    let sample = &body[..body.len().min(1000)];
    if sample.is_empty() {
        return false;
    }

    let suspicious = sample
        .iter()
        .filter(|&&b| !matches!(b, b'\t' | b'\n' | b'\r' | 0x20..=0x7e))
        .count();

    suspicious * 100 > sample.len() * 30
}

/// Whether a body of this kind and size belongs in the object store rather
/// than inline in the cassette. Text is always inline.
pub fn should_store_externally(kind: BodyKind, size: usize, max_inline_size: usize) -> bool {
    matches!(kind, BodyKind::Binary | BodyKind::Stream) && size > max_inline_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_type_wins_over_payload() {
        assert_eq!(
            classify(Some("text/event-stream"), b"plain ascii"),
            BodyKind::Stream
        );
        assert_eq!(
            classify(Some("application/x-ndjson; charset=utf-8"), &[0, 1, 2]),
            BodyKind::Stream
        );
    }

    #[test]
    fn declared_binary_and_text_prefixes() {
        assert_eq!(classify(Some("image/png"), b""), BodyKind::Binary);
        assert_eq!(classify(Some("application/pdf"), b""), BodyKind::Binary);
        assert_eq!(classify(Some("application/json"), b""), BodyKind::Text);
        assert_eq!(
            classify(Some("text/html; charset=utf-8"), b""),
            BodyKind::Text
        );
    }

    #[test]
    fn heuristic_catches_nul_and_high_bytes() {
        assert_eq!(classify(None, b"hello\0world"), BodyKind::Binary);

        let mostly_high: Vec<u8> = (0..100).map(|i| if i < 40 { 0xff } else { b'a' }).collect();
        assert_eq!(classify(None, &mostly_high), BodyKind::Binary);

        assert_eq!(classify(None, b"just text\nwith lines\r\n"), BodyKind::Text);
        assert_eq!(classify(None, b""), BodyKind::Text);
    }

    #[test]
    fn external_routing_by_kind_and_size() {
        assert!(should_store_externally(BodyKind::Binary, 2_000_000, 1000));
        assert!(should_store_externally(BodyKind::Stream, 1001, 1000));
        assert!(!should_store_externally(BodyKind::Binary, 1000, 1000));
        assert!(!should_store_externally(BodyKind::Text, 2_000_000, 1000));
        assert!(!should_store_externally(BodyKind::Stream, 0, 1000));
    }
}
