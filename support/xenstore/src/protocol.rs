// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! xenstored socket wire format.

use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The largest payload xenstored accepts or sends.
pub const PAYLOAD_MAX: usize = 4096;

open_enum! {
    /// The message type of a [`MessageHeader`].
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum MessageType: u32 {
        DIRECTORY = 1,
        READ = 2,
        WATCH = 4,
        UNWATCH = 5,
        WRITE = 11,
        WATCH_EVENT = 15,
        ERROR = 16,
    }
}

/// Precedes every message in both directions. Fields are in host byte
/// order.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub req_id: u32,
    pub tx_id: u32,
    pub len: u32,
}

/// Builds a request payload from NUL-separated fields.
///
/// Every field but the last is NUL terminated. A trailing NUL is added to
/// the last field only when `terminate_last` is set, since `WRITE` takes the
/// value bytes verbatim.
pub fn build_payload(fields: &[&str], terminate_last: bool) -> Vec<u8> {
    let mut payload = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        payload.extend_from_slice(field.as_bytes());
        if i + 1 < fields.len() || terminate_last {
            payload.push(0);
        }
    }
    payload
}

/// Splits a reply payload into its NUL-terminated strings.
pub fn split_strings(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    payload
        .strip_suffix(&[0])
        .unwrap_or(payload)
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
}

/// Parses the `path\0token\0` payload of a `WATCH_EVENT`.
pub fn parse_watch_event(payload: &[u8]) -> Option<(String, String)> {
    let mut fields = payload.split(|&b| b == 0);
    let path = std::str::from_utf8(fields.next()?).ok()?;
    let token = std::str::from_utf8(fields.next()?).ok()?;
    Some((path.to_owned(), token.to_owned()))
}

/// Parses the errno name carried by an `ERROR` reply.
pub fn parse_error(payload: &[u8]) -> String {
    let name = payload.strip_suffix(&[0]).unwrap_or(payload);
    String::from_utf8_lossy(name).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads() {
        assert_eq!(build_payload(&["/a", "tok"], true), b"/a\0tok\0");
        assert_eq!(build_payload(&["/a", "1"], false), b"/a\x001");
        assert_eq!(build_payload(&["/a"], true), b"/a\0");
    }

    #[test]
    fn directory_listing() {
        let names: Vec<_> = split_strings(b"0\x00768\x00").collect();
        assert_eq!(names, [&b"0"[..], &b"768"[..]]);
        assert_eq!(split_strings(b"").count(), 0);
    }

    #[test]
    fn watch_event() {
        assert_eq!(
            parse_watch_event(b"/be/media-present\0media-present\0"),
            Some(("/be/media-present".into(), "media-present".into()))
        );
        assert_eq!(parse_watch_event(b"/only-path"), None);
    }
}
