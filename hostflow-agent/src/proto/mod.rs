//! Application-protocol discovery over the first bytes of a flow.
//!
//! Discovery only classifies; it never parses a protocol further than needed
//! to tell it apart. The detector is stateless except for the reassembly
//! buffer it borrows from the transaction it is classifying.

pub mod http;
pub mod mysql;

pub use http::HttpParser;
pub use mysql::MySqlParser;

use crate::conn::Role;

/// Well-known server port that gates MySQL discovery.
pub const MYSQL_SERVER_PORT: u16 = 3306;

/// Upper bound on the bytes kept while a protocol is still undecided.
const MAX_REASSEMBLY_BYTES: usize = 512;

const HTTP_REQUEST_TOKENS: [&[u8; 4]; 8] = [
    b"GET ", b"POST", b"PUT ", b"DELE", b"TRAC", b"CONN", b"OPTI", b"HEAD",
];
const HTTP_RESPONSE_TOKEN: &[u8; 4] = b"HTTP";

/// Transaction type, ordered from least to most specific. A transaction keeps
/// refining its type while it is at `Ip` or below.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub enum ProtoType {
    #[default]
    Unknown,
    Ip,
    Http,
    MySql,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
    Close,
}

/// Scratch space for payloads split across several receives.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    bytes: Vec<u8>,
}

impl ReassemblyBuffer {
    pub fn append(&mut self, data: &[u8]) {
        let room = MAX_REASSEMBLY_BYTES.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// Protocol parser attached to a transaction once its protocol is known.
#[derive(Debug)]
pub enum ProtocolParser {
    Http(HttpParser),
    MySql(MySqlParser),
}

impl ProtocolParser {
    pub fn parse(&mut self, dir: Direction, data: &[u8]) {
        match self {
            ProtocolParser::Http(parser) => parser.parse(dir, data),
            ProtocolParser::MySql(parser) => parser.parse(dir, data),
        }
    }

    pub fn proto(&self) -> ProtoType {
        match self {
            ProtocolParser::Http(_) => ProtoType::Http,
            ProtocolParser::MySql(_) => ProtoType::MySql,
        }
    }
}

pub struct Detection {
    pub proto: ProtoType,
    pub parser: Option<ProtocolParser>,
}

impl Detection {
    fn plain(proto: ProtoType) -> Self {
        Detection { proto, parser: None }
    }
}

/// Classifies the payload of one read or write.
///
/// HTTP is recognized from the first four bytes alone. MySQL needs the server
/// port as a hint and may have to accumulate bytes across calls before the
/// header check can run; until then the transaction stays unclassified and
/// the caller is expected to retry on the next payload.
pub fn detect_proto(
    reassembly: &mut ReassemblyBuffer,
    server_port: u16,
    role: Option<Role>,
    dir: Direction,
    last_dir: Option<Direction>,
    buf: &[u8],
) -> Detection {
    if is_http(buf) {
        return Detection {
            proto: ProtoType::Http,
            parser: Some(ProtocolParser::Http(HttpParser::default())),
        };
    }

    if server_port == MYSQL_SERVER_PORT {
        return detect_mysql(reassembly, role, dir, last_dir, buf);
    }

    Detection::plain(ProtoType::Ip)
}

fn is_http(buf: &[u8]) -> bool {
    if buf.len() < 4 {
        return false;
    }

    let token = &buf[..4];
    if HTTP_REQUEST_TOKENS.iter().any(|t| token == &t[..]) {
        return true;
    }

    token == HTTP_RESPONSE_TOKEN && buf.get(4) == Some(&b'/')
}

fn detect_mysql(
    reassembly: &mut ReassemblyBuffer,
    role: Option<Role>,
    dir: Direction,
    last_dir: Option<Direction>,
    buf: &[u8],
) -> Detection {
    // Queries are sometimes split across several receives, so the bytes that
    // flow toward the server are accumulated until the header check can run.
    let toward_server = matches!(
        (role, dir),
        (Some(Role::Server), Direction::In) | (Some(Role::Client), Direction::Out)
    );

    if toward_server {
        if last_dir.is_some_and(|last| last != dir) {
            reassembly.clear();
        }
        reassembly.append(buf);
    }

    let data = if reassembly.is_empty() {
        buf
    } else {
        reassembly.as_slice()
    };

    if is_mysql_command(data) {
        return Detection {
            proto: ProtoType::MySql,
            parser: Some(ProtocolParser::MySql(MySqlParser::default())),
        };
    }

    if toward_server {
        // Not enough data yet; keep discovering on the next payload.
        Detection::plain(ProtoType::Unknown)
    } else {
        Detection::plain(ProtoType::Ip)
    }
}

/// First packet of a query: 3-byte little-endian payload length (which must
/// account for all buffered bytes) and a zero sequence number.
fn is_mysql_command(data: &[u8]) -> bool {
    if data.len() < 5 {
        return false;
    }

    let payload_len = usize::from(u16::from_le_bytes([data[0], data[1]]));
    payload_len == data.len() - 4 && data[2] == 0x00 && data[3] == 0
}
