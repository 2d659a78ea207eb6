//! OpenSSH agent protocol: the add-identity exchange.
//!
//! Every message is framed as a big-endian `uint32` length followed by that
//! many payload bytes.  The first payload byte is the opcode.
//!
//! ```text
//! request:  len | 17 (or 25) | string key_type | field... | string comment | constraint...
//! response: len | 6                      (success)
//!           len | 5 [reason]             (failure)
//! ```
//!
//! Nothing here knows about sockets: [`add_identity`] works on any
//! `AsyncRead + AsyncWrite`, so tests drive it over an in-memory duplex.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::AgentError;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH2_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH2_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
pub const SSH_AGENT_EXTENSION_FAILURE: u8 = 28;

pub const SSH_AGENT_CONSTRAIN_LIFETIME: u8 = 1;
pub const SSH_AGENT_CONSTRAIN_CONFIRM: u8 = 2;

/// Largest frame either side will accept (OpenSSH's `AGENT_MAX_LEN`).
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Restrictions the agent applies to an added key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Forget the key after this many seconds.
    Lifetime(u32),
    /// Ask the user before every use.
    Confirm,
}

/// One type-specific key field.
pub enum KeyField {
    /// Unsigned big-endian magnitude, sent as an SSH `mpint`.
    Mpint(Zeroizing<Vec<u8>>),
    /// Sent as an SSH `string`.
    Bytes(Zeroizing<Vec<u8>>),
}

impl KeyField {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Mpint(b) | Self::Bytes(b) => b,
        }
    }
}

/// Wire-ready identity for an add-identity request.
pub struct AgentIdentity {
    pub key_type: String,
    pub fields: Vec<KeyField>,
    pub comment: String,
    pub constraints: Vec<Constraint>,
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("key_type", &self.key_type)
            .field("fields", &format_args!("[{} redacted]", self.fields.len()))
            .field("comment", &self.comment)
            .field("constraints", &self.constraints)
            .finish()
    }
}

/// Agent's answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success,
    Failure { reason: Option<String> },
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    // Frame size is bounded by MAX_FRAME_LEN, so any field fits in a u32.
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

/// SSH `mpint` for a non-negative magnitude: leading zeros stripped, and a
/// zero byte prepended when the top bit is set.
fn put_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude.iter().position(|b| *b != 0).unwrap_or(magnitude.len());
    let digits = &magnitude[start..];
    let pad = digits.first().is_some_and(|b| b & 0x80 != 0);

    put_u32(buf, (digits.len() + usize::from(pad)) as u32);
    if pad {
        buf.push(0);
    }
    buf.extend_from_slice(digits);
}

/// Encode the add-identity payload (without the length prefix).
pub fn encode_add_identity(identity: &AgentIdentity) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(1024));

    buf.push(if identity.constraints.is_empty() {
        SSH2_AGENTC_ADD_IDENTITY
    } else {
        SSH2_AGENTC_ADD_ID_CONSTRAINED
    });
    put_string(&mut buf, identity.key_type.as_bytes());
    for field in &identity.fields {
        match field {
            KeyField::Mpint(m) => put_mpint(&mut buf, m),
            KeyField::Bytes(b) => put_string(&mut buf, b),
        }
    }
    put_string(&mut buf, identity.comment.as_bytes());

    for constraint in &identity.constraints {
        match constraint {
            Constraint::Lifetime(secs) => {
                buf.push(SSH_AGENT_CONSTRAIN_LIFETIME);
                put_u32(&mut buf, *secs);
            }
            Constraint::Confirm => buf.push(SSH_AGENT_CONSTRAIN_CONFIRM),
        }
    }

    buf
}

/// Write one frame.  `write_all` keeps writing across short writes.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> Result<(), AgentError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() || payload.len() > MAX_FRAME_LEN {
        return Err(AgentError::Protocol(format!(
            "refusing to send a {}-byte frame",
            payload.len()
        )));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Fill `buf` completely, looping over short reads.
async fn read_full<R>(r: &mut R, buf: &mut [u8], what: &str) -> Result<(), AgentError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(AgentError::Protocol(format!(
                "connection closed after {filled} of {} {what} bytes",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Read one frame and return its payload.
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>, AgentError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_full(r, &mut len_buf, "length").await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(AgentError::Protocol(format!("bad frame length {len}")));
    }

    let mut payload = vec![0u8; len];
    read_full(r, &mut payload, "payload").await?;
    Ok(payload)
}

/// Interpret a response payload.
pub fn parse_response(payload: &[u8]) -> Result<Response, AgentError> {
    let Some((&opcode, rest)) = payload.split_first() else {
        return Err(AgentError::Protocol("empty response".to_string()));
    };

    match opcode {
        SSH_AGENT_SUCCESS => Ok(Response::Success),
        SSH_AGENT_FAILURE | SSH_AGENT_EXTENSION_FAILURE => Ok(Response::Failure {
            reason: failure_reason(rest),
        }),
        other => Err(AgentError::Protocol(format!("unexpected opcode {other}"))),
    }
}

/// A failure may carry a reason, either as an SSH string or as bare text.
fn failure_reason(rest: &[u8]) -> Option<String> {
    if rest.is_empty() {
        return None;
    }
    let text = match rest.split_first_chunk::<4>() {
        Some((len, body)) if u32::from_be_bytes(*len) as usize == body.len() => body,
        _ => rest,
    };
    let reason = String::from_utf8_lossy(text).trim().to_string();
    (!reason.is_empty()).then_some(reason)
}

/// Send an add-identity request and wait for the agent's verdict.
pub async fn add_identity<S>(stream: &mut S, identity: &AgentIdentity) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = encode_add_identity(identity);
    debug!(
        key_type = %identity.key_type,
        constraints = identity.constraints.len(),
        len = payload.len(),
        "agent: sending add-identity"
    );
    write_frame(stream, &payload).await?;

    let response = read_frame(stream).await?;
    match parse_response(&response)? {
        Response::Success => Ok(()),
        Response::Failure { reason } => Err(AgentError::Rejected { reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn identity(constraints: Vec<Constraint>) -> AgentIdentity {
        AgentIdentity {
            key_type: "ssh-rsa".to_string(),
            fields: vec![
                KeyField::Mpint(Zeroizing::new(vec![0x00, 0x00, 0x81, 0x02])),
                KeyField::Mpint(Zeroizing::new(vec![0x01, 0x00, 0x01])),
                KeyField::Bytes(Zeroizing::new(b"raw".to_vec())),
            ],
            comment: "test key".to_string(),
            constraints,
        }
    }

    /// Minimal SSH reader for checking encoded payloads.
    struct Reader<'a>(&'a [u8]);

    impl Reader<'_> {
        fn byte(&mut self) -> u8 {
            let (b, rest) = self.0.split_first().unwrap();
            self.0 = rest;
            *b
        }
        fn u32(&mut self) -> u32 {
            let (n, rest) = self.0.split_first_chunk::<4>().unwrap();
            self.0 = rest;
            u32::from_be_bytes(*n)
        }
        fn string(&mut self) -> Vec<u8> {
            let len = self.u32() as usize;
            let (s, rest) = self.0.split_at(len);
            self.0 = rest;
            s.to_vec()
        }
    }

    #[test]
    fn mpint_encoding() {
        let mut buf = Vec::new();
        put_mpint(&mut buf, &[0x00, 0x7f]);
        assert_eq!(buf, [0, 0, 0, 1, 0x7f]);

        buf.clear();
        put_mpint(&mut buf, &[0x80]);
        assert_eq!(buf, [0, 0, 0, 2, 0x00, 0x80]);

        buf.clear();
        put_mpint(&mut buf, &[0x00, 0x00]);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn unconstrained_request_layout() {
        let payload = encode_add_identity(&identity(Vec::new()));
        let mut r = Reader(&payload);
        assert_eq!(r.byte(), SSH2_AGENTC_ADD_IDENTITY);
        assert_eq!(r.string(), b"ssh-rsa");
        assert_eq!(r.string(), [0x00, 0x81, 0x02]);
        assert_eq!(r.string(), [0x01, 0x00, 0x01]);
        assert_eq!(r.string(), b"raw");
        assert_eq!(r.string(), b"test key");
        assert!(r.0.is_empty());
    }

    #[test]
    fn constrained_request_layout() {
        let payload = encode_add_identity(&identity(vec![
            Constraint::Lifetime(3600),
            Constraint::Confirm,
        ]));
        let mut r = Reader(&payload);
        assert_eq!(r.byte(), SSH2_AGENTC_ADD_ID_CONSTRAINED);
        for _ in 0..5 {
            r.string();
        }
        assert_eq!(r.byte(), SSH_AGENT_CONSTRAIN_LIFETIME);
        assert_eq!(r.u32(), 3600);
        assert_eq!(r.byte(), SSH_AGENT_CONSTRAIN_CONFIRM);
        assert!(r.0.is_empty());
    }

    #[test]
    fn response_parsing() {
        assert_eq!(parse_response(&[SSH_AGENT_SUCCESS]).unwrap(), Response::Success);
        assert_eq!(
            parse_response(&[SSH_AGENT_FAILURE]).unwrap(),
            Response::Failure { reason: None }
        );
        assert_eq!(
            parse_response(&[SSH_AGENT_EXTENSION_FAILURE]).unwrap(),
            Response::Failure { reason: None }
        );
        assert_eq!(
            parse_response(&[SSH_AGENT_FAILURE, 0, 0, 0, 4, b'n', b'o', b'p', b'e']).unwrap(),
            Response::Failure {
                reason: Some("nope".to_string())
            }
        );
        assert_eq!(
            parse_response(b"\x05locked").unwrap(),
            Response::Failure {
                reason: Some("locked".to_string())
            }
        );
        assert!(matches!(parse_response(&[99]), Err(AgentError::Protocol(_))));
        assert!(matches!(parse_response(&[]), Err(AgentError::Protocol(_))));
    }

    /// Serve one request on `server`, replying with `reply` one byte at a time.
    async fn mock_agent(mut server: tokio::io::DuplexStream, reply: Vec<u8>) -> Vec<u8> {
        let request = read_frame(&mut server).await.unwrap();
        for b in reply {
            server.write_all(&[b]).await.unwrap();
            server.flush().await.unwrap();
        }
        request
    }

    #[tokio::test]
    async fn success_over_tiny_buffer() {
        // A 3-byte pipe forces partial reads and writes on both sides.
        let (mut client, server) = duplex(3);
        let agent = tokio::spawn(mock_agent(server, vec![0, 0, 0, 1, SSH_AGENT_SUCCESS]));

        add_identity(&mut client, &identity(Vec::new())).await.unwrap();

        let request = agent.await.unwrap();
        assert_eq!(request.as_slice(), encode_add_identity(&identity(Vec::new())).as_slice());
    }

    #[tokio::test]
    async fn failure_opcode_is_rejection() {
        let (mut client, server) = duplex(64);
        tokio::spawn(mock_agent(server, vec![0, 0, 0, 1, SSH_AGENT_FAILURE]));

        let err = add_identity(&mut client, &identity(Vec::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected { reason: None }));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_protocol_error() {
        let (mut client, server) = duplex(64);
        tokio::spawn(mock_agent(server, vec![0xff, 0xff, 0xff, 0xff, SSH_AGENT_SUCCESS]));

        let err = add_identity(&mut client, &identity(Vec::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn zero_length_prefix_is_protocol_error() {
        let (mut client, server) = duplex(64);
        tokio::spawn(mock_agent(server, vec![0, 0, 0, 0]));

        let err = add_identity(&mut client, &identity(Vec::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn truncated_response_is_protocol_error() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
            // Promise two bytes, send one, hang up.
            server.write_all(&[0, 0, 0, 2, SSH_AGENT_SUCCESS]).await.unwrap();
        });

        let err = add_identity(&mut client, &identity(Vec::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(ref m) if m.contains("closed")), "{err}");
    }

    #[tokio::test]
    async fn read_frame_reassembles_split_writes() {
        let (mut a, mut b) = duplex(2);
        tokio::spawn(async move {
            write_frame(&mut a, b"hello agent").await.unwrap();
        });
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload, b"hello agent");

        // Nothing else was sent.
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn debug_redacts_fields() {
        let dbg = format!("{:?}", identity(Vec::new()));
        assert!(dbg.contains("[3 redacted]"));
        assert!(!dbg.contains("129"));
    }
}
