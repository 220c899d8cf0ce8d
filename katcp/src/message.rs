//! KATCP message framing: parse and serialize single protocol lines.
//!
//! A message is `<type-char><name>[<id>] <arg> <arg> ...` terminated by LF.
//! The type character is `?` (request), `!` (reply) or `#` (inform). An
//! optional message id appears in square brackets after the name and is
//! echoed back on the matching reply. Arguments are separated by runs of
//! spaces or tabs and use backslash escapes for characters that cannot
//! appear literally, which makes arguments binary-safe.

use crate::{KatcpError, KatcpResult};

/// The three KATCP message categories, keyed by their leading character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `?` — client-to-server request.
    Request,
    /// `!` — server reply terminating a request.
    Reply,
    /// `#` — asynchronous or request-scoped inform.
    Inform,
}

impl MessageKind {
    fn sigil(self) -> char {
        match self {
            MessageKind::Request => '?',
            MessageKind::Reply => '!',
            MessageKind::Inform => '#',
        }
    }

    fn from_sigil(c: char) -> Option<Self> {
        match c {
            '?' => Some(MessageKind::Request),
            '!' => Some(MessageKind::Reply),
            '#' => Some(MessageKind::Inform),
            _ => None,
        }
    }
}

/// One parsed KATCP message.
///
/// Arguments are kept as raw byte vectors: register reads return arbitrary
/// binary data that is not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub name: String,
    /// Optional message id (`?read[7] ...`), echoed on the reply.
    pub id: Option<u32>,
    pub arguments: Vec<Vec<u8>>,
}

impl Message {
    /// Build a request with string arguments.
    pub fn request(name: &str, args: &[&[u8]]) -> Self {
        Message {
            kind: MessageKind::Request,
            name: name.to_string(),
            id: None,
            arguments: args.iter().map(|a| a.to_vec()).collect(),
        }
    }

    /// First argument decoded lossily as text (reply status words, log lines).
    pub fn arg_str(&self, index: usize) -> Option<String> {
        self.arguments
            .get(index)
            .map(|a| String::from_utf8_lossy(a).into_owned())
    }

    /// Serialize onto the wire, including the trailing newline.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 16);
        out.push(self.kind.sigil() as u8);
        out.extend_from_slice(self.name.as_bytes());
        if let Some(id) = self.id {
            out.extend_from_slice(format!("[{id}]").as_bytes());
        }
        for arg in &self.arguments {
            out.push(b' ');
            out.extend_from_slice(&escape_argument(arg));
        }
        out.push(b'\n');
        out
    }

    /// Parse one line (without its terminating newline).
    pub fn parse(line: &[u8]) -> KatcpResult<Self> {
        let line = strip_eol(line);
        if line.is_empty() {
            return Err(KatcpError::Protocol("empty message line".into()));
        }
        let kind = MessageKind::from_sigil(line[0] as char).ok_or_else(|| {
            KatcpError::Protocol(format!("unknown message type {:?}", line[0] as char))
        })?;

        let mut fields = split_fields(&line[1..]);
        if fields.is_empty() {
            return Err(KatcpError::Protocol("message has no name".into()));
        }
        let head = fields.remove(0);
        let head = String::from_utf8_lossy(&head).into_owned();
        let (name, id) = match head.find('[') {
            Some(open) if head.ends_with(']') => {
                let id_str = &head[open + 1..head.len() - 1];
                let id = id_str.parse::<u32>().map_err(|_| {
                    KatcpError::Protocol(format!("bad message id in {head:?}"))
                })?;
                (head[..open].to_string(), Some(id))
            }
            _ => (head, None),
        };

        let arguments = fields
            .into_iter()
            .map(|f| unescape_argument(&f))
            .collect::<KatcpResult<Vec<_>>>()?;

        Ok(Message {
            kind,
            name,
            id,
            arguments,
        })
    }
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Split on runs of spaces/tabs. Escapes are resolved later, so a `\_` inside
/// an argument does not break the field here (backslash consumes the next
/// byte unconditionally).
fn split_fields(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut fields = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            b'\\' if i + 1 < bytes.len() => {
                current.push(b'\\');
                current.push(bytes[i + 1]);
                i += 1;
            }
            b => current.push(b),
        }
        i += 1;
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

/// Escape one argument for the wire.
///
/// Escapes: `\\` backslash, `\_` space, `\0` null, `\n` newline, `\r` CR,
/// `\e` ESC, `\t` tab. The empty argument is the two-byte token `\@`.
pub fn escape_argument(arg: &[u8]) -> Vec<u8> {
    if arg.is_empty() {
        return b"\\@".to_vec();
    }
    let mut out = Vec::with_capacity(arg.len());
    for &b in arg {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' => out.extend_from_slice(b"\\_"),
            0x00 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x1b => out.extend_from_slice(b"\\e"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b => out.push(b),
        }
    }
    out
}

/// Undo [`escape_argument`].
pub fn unescape_argument(arg: &[u8]) -> KatcpResult<Vec<u8>> {
    let mut out = Vec::with_capacity(arg.len());
    let mut i = 0;
    while i < arg.len() {
        if arg[i] == b'\\' {
            let next = *arg.get(i + 1).ok_or_else(|| {
                KatcpError::Protocol("trailing backslash in argument".into())
            })?;
            match next {
                b'\\' => out.push(b'\\'),
                b'_' => out.push(b' '),
                b'0' => out.push(0x00),
                b'n' => out.push(b'\n'),
                b'r' => out.push(b'\r'),
                b'e' => out.push(0x1b),
                b't' => out.push(b'\t'),
                b'@' => {}
                other => {
                    return Err(KatcpError::Protocol(format!(
                        "unknown escape \\{}",
                        other as char
                    )))
                }
            }
            i += 2;
        } else {
            out.push(arg[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips_binary() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let escaped = escape_argument(&payload);
        assert!(!escaped.contains(&b' '));
        assert!(!escaped.contains(&b'\n'));
        assert_eq!(unescape_argument(&escaped).unwrap(), payload);
    }

    #[test]
    fn empty_argument_token() {
        assert_eq!(escape_argument(b""), b"\\@");
        assert_eq!(unescape_argument(b"\\@").unwrap(), b"");
    }

    #[test]
    fn parse_reply_with_status() {
        let msg = Message::parse(b"!read ok \\0\\0\\0\\n\n").unwrap();
        assert_eq!(msg.kind, MessageKind::Reply);
        assert_eq!(msg.name, "read");
        assert_eq!(msg.arg_str(0).unwrap(), "ok");
        assert_eq!(msg.arguments[1], vec![0, 0, 0, b'\n']);
    }

    #[test]
    fn parse_message_id() {
        let msg = Message::parse(b"?wordread[42] acc_cnt 0 1").unwrap();
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.name, "wordread");
        assert_eq!(msg.id, Some(42));
        assert_eq!(msg.arguments.len(), 3);
    }

    #[test]
    fn serialize_escapes_spaces() {
        let msg = Message::request("write", &[b"reg name", b"0"]);
        assert_eq!(msg.to_bytes(), b"?write reg\\_name 0\n");
    }

    #[test]
    fn serialize_parse_round_trip() {
        let msg = Message {
            kind: MessageKind::Inform,
            name: "rfdc-status".into(),
            id: None,
            arguments: vec![b"ADC0: Enabled 1, State: 15 PLL: 1".to_vec()],
        };
        let parsed = Message::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejects_garbage_sigil() {
        assert!(Message::parse(b"%oops arg").is_err());
    }
}
