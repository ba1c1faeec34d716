//! SOAP envelopes, WS-Security headers and the tolerant XML field extraction
//! used against ONVIF devices. Camera firmware disagrees about namespace
//! prefixes, so lookups match on local element names only.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::models::Credentials;

pub const NS_DEVICE: &str = "http://www.onvif.org/ver10/device/wsdl";
pub const NS_MEDIA: &str = "http://www.onvif.org/ver10/media/wsdl";

pub fn envelope(body: &str, credentials: Option<&Credentials>) -> String {
    let header = credentials
        .and_then(wsse_header)
        .map(|h| format!("<s:Header>{}</s:Header>", h))
        .unwrap_or_default();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\"\n\
          xmlns:tt=\"http://www.onvif.org/ver10/schema\"\n\
          xmlns:tds=\"{}\"\n\
          xmlns:trt=\"{}\">\n\
           {}\n\
           <s:Body>{}</s:Body>\n\
         </s:Envelope>",
        NS_DEVICE, NS_MEDIA, header, body
    )
}

/// UsernameToken with PasswordDigest. An empty password is still a valid
/// token (several vendors ship with a blank admin secret).
fn wsse_header(credentials: &Credentials) -> Option<String> {
    if credentials.username.is_empty() {
        return None;
    }
    let nonce_bytes = *Uuid::new_v4().as_bytes();
    let created = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let digest = password_digest(&nonce_bytes, &created, &credentials.password);

    Some(format!(
        "<wsse:Security s:mustUnderstand=\"1\"\n\
            xmlns:wsse=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd\"\n\
            xmlns:wsu=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd\">\n\
            <wsse:UsernameToken>\n\
                <wsse:Username>{}</wsse:Username>\n\
                <wsse:Password Type=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest\">{}</wsse:Password>\n\
                <wsse:Nonce EncodingType=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary\">{}</wsse:Nonce>\n\
                <wsu:Created>{}</wsu:Created>\n\
            </wsse:UsernameToken>\n\
        </wsse:Security>",
        xml_escape(&credentials.username),
        digest,
        B64.encode(nonce_bytes),
        created
    ))
}

/// Base64(SHA1(nonce + created + password))
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    B64.encode(hasher.finalize())
}

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Byte offset just past the opening tag `<prefix:name ...>` or `<name ...>`,
/// searching from `from`. Self-closing tags are skipped.
fn find_open_tag(xml: &str, name: &str, from: usize) -> Option<(usize, usize)> {
    let mut cursor = from;
    while let Some(rel) = xml.get(cursor..)?.find('<') {
        let start = cursor + rel;
        let rest = &xml[start + 1..];
        let tag_end = rest.find('>')?;
        let tag = &rest[..tag_end];
        cursor = start + 1;

        if tag.starts_with('/') || tag.starts_with('?') || tag.starts_with('!') || tag.ends_with('/') {
            continue;
        }
        let qualified = tag.split_whitespace().next().unwrap_or("");
        let local = qualified.rsplit(':').next().unwrap_or(qualified);
        if local == name {
            return Some((start, start + 1 + tag_end + 1));
        }
    }
    None
}

/// Offset of the closing tag matching `name`, starting at `from`.
fn find_close_tag(xml: &str, name: &str, from: usize) -> Option<(usize, usize)> {
    let mut cursor = from;
    while let Some(rel) = xml.get(cursor..)?.find("</") {
        let start = cursor + rel;
        let rest = &xml[start + 2..];
        let tag_end = rest.find('>')?;
        let qualified = rest[..tag_end].trim();
        let local = qualified.rsplit(':').next().unwrap_or(qualified);
        if local == name {
            return Some((start, start + 2 + tag_end + 1));
        }
        cursor = start + 2;
    }
    None
}

/// Inner XML of the first element with local name `name`.
pub fn element_inner<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let (_, content_start) = find_open_tag(xml, name, 0)?;
    let (content_end, _) = find_close_tag(xml, name, content_start)?;
    xml.get(content_start..content_end)
}

/// Trimmed, unescaped text of the first element with local name `name`.
/// Empty elements yield `None`.
pub fn element_text(xml: &str, name: &str) -> Option<String> {
    let inner = element_inner(xml, name)?;
    let value = xml_unescape(inner.trim());
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Every element with local name `name`, as outer XML slices.
pub fn elements<'a>(xml: &'a str, name: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some((start, content_start)) = find_open_tag(xml, name, cursor) {
        match find_close_tag(xml, name, content_start) {
            Some((_, end)) => {
                if let Some(slice) = xml.get(start..end) {
                    found.push(slice);
                }
                cursor = end;
            }
            None => break,
        }
    }
    found
}

/// Value of `attr` on the first element with local name `name`.
pub fn attribute(xml: &str, name: &str, attr: &str) -> Option<String> {
    let (start, content_start) = find_open_tag(xml, name, 0)?;
    let tag = xml.get(start..content_start)?;
    let needle = format!("{}=", attr);
    let mut search = 0;
    while let Some(rel) = tag[search..].find(&needle) {
        let pos = search + rel;
        let preceded_by_space = tag[..pos].ends_with(char::is_whitespace);
        let after = &tag[pos + needle.len()..];
        if preceded_by_space {
            let quote = after.chars().next()?;
            if quote == '"' || quote == '\'' {
                let value = &after[1..];
                let end = value.find(quote)?;
                return Some(xml_unescape(&value[..end]));
            }
        }
        search = pos + needle.len();
    }
    None
}

/// Fault reason and subcode text when the body is a SOAP fault.
pub fn fault(xml: &str) -> Option<String> {
    let body = element_inner(xml, "Fault")?;
    let reason = element_text(body, "Text")
        .or_else(|| element_text(body, "faultstring"))
        .unwrap_or_default();
    let subcode = element_inner(body, "Subcode")
        .and_then(|s| element_text(s, "Value"))
        .unwrap_or_default();
    Some(format!("{} {}", subcode, reason).trim().to_string())
}

/// Whether a fault text indicates rejected credentials.
pub fn is_auth_fault(fault_text: &str) -> bool {
    let lowered = fault_text.to_ascii_lowercase();
    lowered.contains("notauthorized")
        || lowered.contains("not authorized")
        || lowered.contains("failedauthentication")
        || lowered.contains("sender not authorized")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_INFO: &str = r#"<?xml version="1.0"?>
        <SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope">
          <SOAP-ENV:Body>
            <tds:GetDeviceInformationResponse>
              <tds:Manufacturer>ACME &amp; Sons</tds:Manufacturer>
              <tds:Model>LPR-200</tds:Model>
              <tds:FirmwareVersion> 2.4.1 </tds:FirmwareVersion>
              <tds:SerialNumber></tds:SerialNumber>
            </tds:GetDeviceInformationResponse>
          </SOAP-ENV:Body>
        </SOAP-ENV:Envelope>"#;

    #[test]
    fn test_element_text_ignores_prefix_and_trims() {
        assert_eq!(element_text(DEVICE_INFO, "Manufacturer").as_deref(), Some("ACME & Sons"));
        assert_eq!(element_text(DEVICE_INFO, "FirmwareVersion").as_deref(), Some("2.4.1"));
        assert_eq!(element_text(DEVICE_INFO, "SerialNumber"), None);
        assert_eq!(element_text(DEVICE_INFO, "HardwareId"), None);
    }

    #[test]
    fn test_element_name_must_match_exactly() {
        let xml = "<tt:UriPrefix>nope</tt:UriPrefix><tt:Uri>rtsp://cam/1</tt:Uri>";
        assert_eq!(element_text(xml, "Uri").as_deref(), Some("rtsp://cam/1"));
    }

    #[test]
    fn test_elements_and_attributes() {
        let xml = r#"<trt:Profiles token="main" fixed="true"><tt:Name>Main</tt:Name></trt:Profiles>
                     <trt:Profiles fixed="false" token='sub'><tt:Name>Sub</tt:Name></trt:Profiles>"#;
        let profiles = elements(xml, "Profiles");
        assert_eq!(profiles.len(), 2);
        assert_eq!(attribute(profiles[0], "Profiles", "token").as_deref(), Some("main"));
        assert_eq!(attribute(profiles[1], "Profiles", "token").as_deref(), Some("sub"));
        assert_eq!(element_text(profiles[1], "Name").as_deref(), Some("Sub"));
    }

    #[test]
    fn test_fault_detection() {
        let xml = r#"<env:Envelope><env:Body><env:Fault>
            <env:Code><env:Value>env:Sender</env:Value>
              <env:Subcode><env:Value>ter:NotAuthorized</env:Value></env:Subcode></env:Code>
            <env:Reason><env:Text xml:lang="en">Sender not Authorized</env:Text></env:Reason>
            </env:Fault></env:Body></env:Envelope>"#;
        let text = fault(xml).unwrap();
        assert!(is_auth_fault(&text));
        assert!(fault(DEVICE_INFO).is_none());
    }

    #[test]
    fn test_envelope_security_header() {
        let with_creds = envelope("<tds:GetDeviceInformation/>", Some(&Credentials::new("admin", "")));
        assert!(with_creds.contains("<wsse:Username>admin</wsse:Username>"));
        assert!(with_creds.contains("PasswordDigest"));

        let anonymous = envelope("<tds:GetSystemDateAndTime/>", None);
        assert!(!anonymous.contains("wsse:Security"));
    }

    #[test]
    fn test_password_digest_is_deterministic() {
        let a = password_digest(b"nonce", "2024-01-01T00:00:00Z", "secret");
        let b = password_digest(b"nonce", "2024-01-01T00:00:00Z", "secret");
        let c = password_digest(b"nonce", "2024-01-01T00:00:00Z", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // SHA1 digest is 20 bytes -> 28 base64 chars
        assert_eq!(a.len(), 28);
    }
}
