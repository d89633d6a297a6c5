use rsip::prelude::UntypedHeader;

pub trait RsipHeadersExt {
    fn push_front(&mut self, header: rsip::Header);
}

impl RsipHeadersExt for rsip::Headers {
    fn push_front(&mut self, header: rsip::Header) {
        let mut headers = self.iter().cloned().collect::<Vec<_>>();
        headers.insert(0, header);
        *self = headers.into();
    }
}

#[macro_export]
macro_rules! header_pop {
    ($iter:expr, $header:path) => {
        let mut first = true;
        $iter.retain(|h| {
            if first && matches!(h, $header(_)) {
                first = false;
                false
            } else {
                true
            }
        });
    };
}

/// Raw values of every header matching `name`, case-insensitive.
///
/// Covers both the enumerated rsip variants and `Header::Other` so
/// extension headers (Path, Reason, ...) are seen too.
pub fn header_values<'a>(headers: &'a rsip::Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| match h {
            rsip::Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.clone()),
            rsip::Header::Supported(v) if name.eq_ignore_ascii_case("supported") => {
                Some(v.value().to_string())
            }
            rsip::Header::Require(v) if name.eq_ignore_ascii_case("require") => {
                Some(v.value().to_string())
            }
            rsip::Header::Route(v) if name.eq_ignore_ascii_case("route") => {
                Some(v.value().to_string())
            }
            rsip::Header::RecordRoute(v) if name.eq_ignore_ascii_case("record-route") => {
                Some(v.value().to_string())
            }
            _ => None,
        })
        .collect()
}

/// True when a comma-separated token header (Supported, Require, Allow)
/// carries `token`.
pub fn header_contains_token(headers: &rsip::Headers, name: &str, token: &str) -> bool {
    header_values(headers, name)
        .iter()
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// StatusCode from a bare number; codes rsip does not enumerate fall
/// back through its TryFrom impl.
pub fn status_code_by_number(code: u16) -> rsip::StatusCode {
    rsip::StatusCode::try_from(code).unwrap_or(rsip::StatusCode::ServerInternalError)
}

/// RFC 3326 Reason header. Synthetic responses use this to carry the
/// phrase the status line cannot ("Timer B Timeout", ...).
pub fn reason_header(code: u16, text: &str) -> rsip::Header {
    rsip::Header::Other("Reason".into(), format!("SIP;cause={};text=\"{}\"", code, text))
}

/// The text="..." part of the first Reason header, if any.
pub fn reason_text(headers: &rsip::Headers) -> Option<String> {
    let value = header_values(headers, "reason").into_iter().next()?;
    let start = value.find("text=\"")? + 6;
    let rest = &value[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

pub fn uri_user(uri: &rsip::Uri) -> Option<&str> {
    uri.auth.as_ref().map(|a| a.user.as_str())
}

#[test]
fn test_rsip_headers_ext() {
    use rsip::{Header, Headers};
    let mut headers: Headers = vec![
        Header::Via("SIP/2.0/TCP".into()),
        Header::Via("SIP/2.0/UDP".into()),
    ]
    .into();
    headers.push_front(Header::Via("SIP/2.0/TLS".into()));
    assert_eq!(headers.iter().count(), 3);
    header_pop!(headers, Header::Via);
    assert_eq!(headers.iter().count(), 2);
    assert_eq!(
        headers.iter().next(),
        Some(&Header::Via("SIP/2.0/TCP".into()))
    );
}

#[test]
fn test_header_tokens() {
    let headers: rsip::Headers = vec![
        rsip::Header::Other("Supported".into(), "path, outbound".into()),
        rsip::Header::Other("Reason".into(), "SIP;cause=408;text=\"Timer B Timeout\"".into()),
    ]
    .into();
    assert!(header_contains_token(&headers, "Supported", "outbound"));
    assert!(header_contains_token(&headers, "supported", "PATH"));
    assert!(!header_contains_token(&headers, "Supported", "gruu"));
    assert_eq!(reason_text(&headers).as_deref(), Some("Timer B Timeout"));
}
