// SPDX-License-Identifier: MIT
// RFC 822 → IncomingMessage via mailparse.

use chrono::{DateTime, Utc};
use mailparse::{addrparse, parse_mail, DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use super::{IncomingAttachment, IncomingMessage, SourceError};

/// Parse a raw RFC 822 message fetched from the source mailbox.
///
/// `received_at` is stamped by the caller at fetch time; the Date header is
/// sender-controlled and only good for display.
pub fn parse_rfc822(
    raw: &[u8],
    uid: u32,
    received_at: DateTime<Utc>,
) -> Result<IncomingMessage, SourceError> {
    let parsed = parse_mail(raw).map_err(|e| SourceError::Protocol(format!("uid {uid}: {e}")))?;

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default()
        .trim()
        .to_string();
    let sender = parsed
        .headers
        .get_first_value("From")
        .unwrap_or_default()
        .trim()
        .to_string();
    // Message-ID is unique within the source; fall back to the UID so the
    // idempotency key is never empty.
    let source_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().trim_matches(['<', '>']).to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("uid-{uid}"));

    let mut recipients = Vec::new();
    for header in ["Delivered-To", "To", "Cc"] {
        if let Some(value) = parsed.headers.get_first_value(header) {
            collect_addresses(&value, &mut recipients);
        }
    }

    let mut extracted = Extracted::default();
    walk_parts(&parsed, &mut extracted);

    Ok(IncomingMessage {
        source_id,
        recipients,
        sender,
        subject,
        received_at,
        body_text: extracted.body_text.unwrap_or_default(),
        body_html: extracted.body_html,
        attachments: extracted.attachments,
    })
}

/// Pull bare, lowercased addresses out of an address header value.
fn collect_addresses(value: &str, out: &mut Vec<String>) {
    match addrparse(value) {
        Ok(list) => {
            for addr in list.iter() {
                match addr {
                    MailAddr::Single(info) => push_unique(out, &info.addr),
                    MailAddr::Group(group) => {
                        for info in &group.addrs {
                            push_unique(out, &info.addr);
                        }
                    }
                }
            }
        }
        // Malformed header — salvage anything that looks like an address.
        Err(_) => {
            for token in value.split([',', ';', ' ']) {
                let token = token.trim().trim_matches(['<', '>']);
                if token.contains('@') {
                    push_unique(out, token);
                }
            }
        }
    }
}

fn push_unique(out: &mut Vec<String>, addr: &str) {
    let normalized = addr.trim().to_lowercase();
    if !normalized.is_empty() && !out.contains(&normalized) {
        out.push(normalized);
    }
}

#[derive(Default)]
struct Extracted {
    body_text: Option<String>,
    body_html: Option<String>,
    attachments: Vec<IncomingAttachment>,
}

/// Depth-first walk over MIME parts: first text/plain and text/html become
/// the bodies, everything with an attachment disposition (or a filename)
/// becomes an attachment.
fn walk_parts(part: &ParsedMail<'_>, out: &mut Extracted) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, out);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());

    let is_attachment =
        disposition.disposition == DispositionType::Attachment || filename.is_some();

    if is_attachment {
        if let Ok(data) = part.get_body_raw() {
            out.attachments.push(IncomingAttachment {
                filename: filename.unwrap_or_else(|| "unnamed".to_string()),
                content_type: part.ctype.mimetype.clone(),
                data,
            });
        }
        return;
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" if out.body_text.is_none() => {
            if let Ok(body) = part.get_body() {
                out.body_text = Some(body);
            }
        }
        "text/html" if out.body_html.is_none() => {
            if let Ok(body) = part.get_body() {
                out.body_html = Some(body);
            }
        }
        _ => {}
    }
}
