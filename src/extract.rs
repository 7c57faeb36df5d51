//! Fact extraction from a single message: sender, date, and plain-text body.
//!
//! Extraction is best-effort. Missing headers and undecodable bodies come back
//! as empty values, never as errors.

use base64::Engine;
use chrono::{DateTime, Utc};

use crate::source::{MessageHeader, MessagePart, SourceMessage};

/// Facts pulled from one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFacts {
    /// Lower-cased sender address, empty when the From header is missing.
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    /// Plain-text body, empty when none could be decoded.
    pub body: String,
}

pub fn extract_facts(message: &SourceMessage) -> MessageFacts {
    let headers = message.headers();
    MessageFacts {
        sender: extract_sender(headers),
        date: extract_date(headers),
        body: extract_body(message),
    }
}

fn header_value<'a>(headers: &'a [MessageHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Sender address from the From header.
///
/// `Display Name <addr>` yields the bracketed address; anything else is used
/// as-is. Always trimmed and lower-cased.
pub fn extract_sender(headers: &[MessageHeader]) -> String {
    let value = match header_value(headers, "From") {
        Some(v) => v,
        None => return String::new(),
    };
    let address = match value.find('<') {
        Some(lt) => {
            let rest = &value[lt + 1..];
            match rest.find('>') {
                Some(gt) => &rest[..gt],
                None => value,
            }
        }
        None => value,
    };
    address.trim().to_lowercase()
}

/// Message date from the Date header (RFC 2822), normalised to UTC.
pub fn extract_date(headers: &[MessageHeader]) -> Option<DateTime<Utc>> {
    let raw = header_value(headers, "Date")?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Common non-conforming forms: trailing zone comment ("... +0000 (UTC)").
    let without_comment = match raw.find(" (") {
        Some(idx) => raw[..idx].trim(),
        None => raw,
    };
    if let Ok(dt) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(dt.with_timezone(&Utc));
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            log::debug!("extract: unparseable Date header {:?}: {}", raw, e);
            None
        }
    }
}

/// Plain-text body.
///
/// Prefers the first `text/plain` part anywhere in the MIME tree; for
/// single-part messages falls back to the payload body itself. Returns an
/// empty string when neither exists or decoding fails.
pub fn extract_body(message: &SourceMessage) -> String {
    let payload = match message.payload.as_ref() {
        Some(p) => p,
        None => return String::new(),
    };

    if !payload.parts.is_empty() {
        return find_plain_part(payload).unwrap_or_default();
    }

    if is_plain_or_unspecified(&payload.mime_type) {
        return decode_part(payload).unwrap_or_default();
    }
    String::new()
}

fn is_plain_or_unspecified(mime_type: &str) -> bool {
    mime_type.is_empty() || mime_type.eq_ignore_ascii_case("text/plain")
}

/// Depth-first search for the first `text/plain` part that decodes.
fn find_plain_part(part: &MessagePart) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case("text/plain") {
        if let Some(text) = decode_part(part) {
            return Some(text);
        }
    }
    part.parts.iter().find_map(find_plain_part)
}

fn decode_part(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    decode_url_safe_base64(data)
}

/// Decode URL-safe base64 as used by the Gmail API. Padding is optional.
fn decode_url_safe_base64(data: &str) -> Option<String> {
    let trimmed = data.trim().trim_end_matches('=');
    match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed) {
        Ok(bytes) => String::from_utf8(bytes).ok(),
        Err(e) => {
            log::debug!("extract: body decode failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PartBody;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &str)]) -> Vec<MessageHeader> {
        pairs
            .iter()
            .map(|(n, v)| MessageHeader {
                name: n.to_string(),
                value: v.to_string(),
            })
            .collect()
    }

    fn encoded(text: &str) -> Option<PartBody> {
        Some(PartBody {
            data: Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text)),
        })
    }

    #[test]
    fn test_sender_display_name_form() {
        let h = headers(&[("From", "Jane Doe <Jane.Doe@Customer.com>")]);
        assert_eq!(extract_sender(&h), "jane.doe@customer.com");
    }

    #[test]
    fn test_sender_first_bracketed_address_wins() {
        let h = headers(&[("From", "A <a@x.com>, B <b@y.com>")]);
        assert_eq!(extract_sender(&h), "a@x.com");
        let h = headers(&[("From", "Alice <Alice@x.com> (via list>)")]);
        assert_eq!(extract_sender(&h), "alice@x.com");
    }

    #[test]
    fn test_sender_unclosed_bracket_uses_whole_value() {
        let h = headers(&[("From", "Bob <bob@x.com")]);
        assert_eq!(extract_sender(&h), "bob <bob@x.com");
    }

    #[test]
    fn test_sender_bare_address() {
        let h = headers(&[("from", "  NoReply@Example.com ")]);
        assert_eq!(extract_sender(&h), "noreply@example.com");
    }

    #[test]
    fn test_sender_missing() {
        let h = headers(&[("Subject", "hi")]);
        assert_eq!(extract_sender(&h), "");
    }

    #[test]
    fn test_date_rfc2822() {
        let h = headers(&[("Date", "Sun, 8 Feb 2026 09:30:00 -0500")]);
        assert_eq!(
            extract_date(&h),
            Some(Utc.with_ymd_and_hms(2026, 2, 8, 14, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_date_with_zone_comment() {
        let h = headers(&[("Date", "Mon, 9 Feb 2026 10:00:00 +0000 (UTC)")]);
        assert_eq!(
            extract_date(&h),
            Some(Utc.with_ymd_and_hms(2026, 2, 9, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_date_unparseable() {
        let h = headers(&[("Date", "sometime last week")]);
        assert_eq!(extract_date(&h), None);
        assert_eq!(extract_date(&[]), None);
    }

    #[test]
    fn test_body_prefers_nested_plain_part() {
        let message = SourceMessage {
            id: "m1".into(),
            payload: Some(MessagePart {
                mime_type: "multipart/mixed".into(),
                headers: vec![],
                body: None,
                parts: vec![
                    MessagePart {
                        mime_type: "multipart/alternative".into(),
                        parts: vec![
                            MessagePart {
                                mime_type: "text/html".into(),
                                body: encoded("<p>html</p>"),
                                ..Default::default()
                            },
                            MessagePart {
                                mime_type: "text/plain".into(),
                                body: encoded("plain text body"),
                                ..Default::default()
                            },
                        ],
                        ..Default::default()
                    },
                    MessagePart {
                        mime_type: "text/plain".into(),
                        body: encoded("second plain part"),
                        ..Default::default()
                    },
                ],
            }),
        };
        assert_eq!(extract_body(&message), "plain text body");
    }

    #[test]
    fn test_body_single_part() {
        let message = SourceMessage::fixture("a@x.com", "Mon, 9 Feb 2026 10:00:00 +0000", "hello");
        assert_eq!(extract_body(&message), "hello");
    }

    #[test]
    fn test_body_html_only_is_empty() {
        let message = SourceMessage {
            id: "m2".into(),
            payload: Some(MessagePart {
                mime_type: "text/html".into(),
                body: encoded("<p>hi</p>"),
                ..Default::default()
            }),
        };
        assert_eq!(extract_body(&message), "");
    }

    #[test]
    fn test_body_decode_failure_is_swallowed() {
        let message = SourceMessage {
            id: "m3".into(),
            payload: Some(MessagePart {
                mime_type: "text/plain".into(),
                body: Some(PartBody {
                    data: Some("!!!not base64!!!".into()),
                }),
                ..Default::default()
            }),
        };
        assert_eq!(extract_body(&message), "");
    }

    #[test]
    fn test_body_accepts_padded_base64() {
        let message = SourceMessage {
            id: "m4".into(),
            payload: Some(MessagePart {
                mime_type: "text/plain".into(),
                body: Some(PartBody {
                    data: Some("SGk=".into()),
                }),
                ..Default::default()
            }),
        };
        assert_eq!(extract_body(&message), "Hi");
    }

    #[test]
    fn test_extract_facts_no_payload() {
        let facts = extract_facts(&SourceMessage::default());
        assert_eq!(facts.sender, "");
        assert_eq!(facts.date, None);
        assert_eq!(facts.body, "");
    }
}
