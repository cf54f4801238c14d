//! Channel requests relayed between client and upstream, with their SSH
//! wire payloads for the event log.

use russh::{Pty, Sig};

/// Requests consumed by the proxy and never forwarded.
pub const SWALLOWED_REQUESTS: &[&str] = &["no-more-sessions@openssh.com", "hostkeys-00@openssh.com"];

pub fn should_forward(request_type: &str) -> bool {
    !SWALLOWED_REQUESTS.contains(&request_type)
}

/// The only channel type the proxy relays.
pub const SUPPORTED_CHANNEL_TYPE: &str = "session";

#[derive(Debug, Clone)]
pub enum ChannelRequest {
    Pty {
        term: String,
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    X11 {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen_number: u32,
    },
}

impl ChannelRequest {
    pub fn request_type(&self) -> &'static str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec(_) => "exec",
            ChannelRequest::Subsystem(_) => "subsystem",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Signal(_) => "signal",
            ChannelRequest::X11 { .. } => "x11-req",
        }
    }

    /// Whether the upstream can be asked to answer this request. russh sends
    /// window-change and signal without a reply flag.
    pub fn upstream_replies(&self) -> bool {
        !matches!(self, ChannelRequest::WindowChange { .. } | ChannelRequest::Signal(_))
    }

    /// Request-specific data as it appears on the wire (RFC 4254 §6).
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ChannelRequest::Pty {
                term,
                cols,
                rows,
                pix_width,
                pix_height,
                modes,
            } => {
                put_string(&mut buf, term.as_bytes());
                put_u32(&mut buf, *cols);
                put_u32(&mut buf, *rows);
                put_u32(&mut buf, *pix_width);
                put_u32(&mut buf, *pix_height);
                let mut encoded = Vec::with_capacity(modes.len() * 5 + 1);
                for (opcode, value) in modes {
                    encoded.push(*opcode as u8);
                    put_u32(&mut encoded, *value);
                }
                encoded.push(0);
                put_string(&mut buf, &encoded);
            }
            ChannelRequest::Shell => {}
            ChannelRequest::Exec(command) => put_string(&mut buf, command),
            ChannelRequest::Subsystem(name) => put_string(&mut buf, name.as_bytes()),
            ChannelRequest::Env { name, value } => {
                put_string(&mut buf, name.as_bytes());
                put_string(&mut buf, value.as_bytes());
            }
            ChannelRequest::WindowChange {
                cols,
                rows,
                pix_width,
                pix_height,
            } => {
                put_u32(&mut buf, *cols);
                put_u32(&mut buf, *rows);
                put_u32(&mut buf, *pix_width);
                put_u32(&mut buf, *pix_height);
            }
            ChannelRequest::Signal(sig) => put_string(&mut buf, sig.name().as_bytes()),
            ChannelRequest::X11 {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen_number,
            } => {
                buf.push(u8::from(*single_connection));
                put_string(&mut buf, auth_protocol.as_bytes());
                put_string(&mut buf, auth_cookie.as_bytes());
                put_u32(&mut buf, *screen_number);
            }
        }
        buf
    }

    /// Terminal geometry carried by this request as `(rows, cols)`.
    pub fn geometry(&self) -> Option<(u32, u32)> {
        let payload = self.payload();
        let (cols, rows) = match self {
            ChannelRequest::Pty { .. } => parse_pty_dims(&payload)?,
            ChannelRequest::WindowChange { .. } => parse_window_dims(&payload)?,
            _ => return None,
        };
        Some((rows, cols))
    }
}

/// Extract `(width, height)` in characters from a `pty-req` payload.
///
/// The terminal name length is read from byte 3 only, so names longer than
/// 255 bytes are not supported. Short payloads yield `None`.
pub fn parse_pty_dims(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() < 4 {
        return None;
    }
    let term_len = payload[3] as usize;
    let offset = 4 + term_len;
    if payload.len() < offset + 8 {
        return None;
    }
    Some((read_u32(&payload[offset..]), read_u32(&payload[offset + 4..])))
}

/// Extract `(width, height)` from a `window-change` payload.
pub fn parse_window_dims(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() < 8 {
        return None;
    }
    Some((read_u32(payload), read_u32(&payload[4..])))
}

pub fn exit_status_payload(status: u32) -> Vec<u8> {
    status.to_be_bytes().to_vec()
}

pub fn exit_signal_payload(signal: &Sig, core_dumped: bool, message: &str, lang: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    put_string(&mut buf, signal.name().as_bytes());
    buf.push(u8::from(core_dumped));
    put_string(&mut buf, message.as_bytes());
    put_string(&mut buf, lang.as_bytes());
    buf
}

pub fn tcpip_forward_payload(address: &str, port: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    put_string(&mut buf, address.as_bytes());
    put_u32(&mut buf, port);
    buf
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &[u8]) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s);
}

trait SigName {
    fn name(&self) -> String;
}

impl SigName for Sig {
    fn name(&self) -> String {
        match self {
            Sig::ABRT => "ABRT".into(),
            Sig::ALRM => "ALRM".into(),
            Sig::FPE => "FPE".into(),
            Sig::HUP => "HUP".into(),
            Sig::ILL => "ILL".into(),
            Sig::INT => "INT".into(),
            Sig::KILL => "KILL".into(),
            Sig::PIPE => "PIPE".into(),
            Sig::QUIT => "QUIT".into(),
            Sig::SEGV => "SEGV".into(),
            Sig::TERM => "TERM".into(),
            Sig::USR1 => "USR1".into(),
            Sig::Custom(name) => name.clone(),
        }
    }
}
