pub mod codec;
pub mod forwarder;
pub mod server;

pub use codec::Codec;
pub use forwarder::{Forwarder, UdpUpstream, Upstream};
pub use server::{Handler, Server};

use bytes::BufMut;
use nom::error::{ErrorKind, ParseError};
use nom::ErrorConvert;

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// DNS messages carried over UDP are restricted to 512 bytes (RFC 1035
/// section 4.2.1). EDNS0 is not supported, so this is a hard limit.
pub const MAX_DATAGRAM_LEN: usize = 512;

/// Labels are restricted to 63 octets (RFC 1035 section 2.3.4).
pub const MAX_LABEL_LEN: usize = 63;

pub const HEADER_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("packet truncated")]
    TruncatedPacket,
    #[error("malformed domain name")]
    MalformedName,
    #[error("message of {0} bytes exceeds the 512 byte limit")]
    OversizedMessage(usize),
    #[error("invalid IPv4 address: {0:?}")]
    InvalidAddress(String),
    #[error("upstream resolver unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("malformed upstream response: {0}")]
    UpstreamMalformedResponse(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// Every complete nom parser used by the decoder only fails by running out of
// input. Name errors are raised explicitly as `nom::Err::Failure`.
impl<I> ParseError<I> for Error {
    fn from_error_kind(_input: I, _kind: ErrorKind) -> Self {
        Error::TruncatedPacket
    }

    fn append(_input: I, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

impl ErrorConvert<Error> for Error {
    fn convert(self) -> Error {
        self
    }
}

/// A decoded (or to be encoded) DNS message.
///
/// Authority and additional sections are not modeled; `ns_count` and
/// `ar_count` are carried in the header as declared but their records are
/// never read nor written.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
}

impl Message {
    /// Builds the single-question query forwarded upstream for `question`.
    ///
    /// The transaction id and the RD flag are taken over from the client's
    /// header, everything else is a plain standard query.
    pub fn sub_query(header: &Header, question: Question) -> Self {
        Self {
            header: Header {
                id: header.id,
                recursion_desired: header.recursion_desired,
                qd_count: 1,
                ..Header::default()
            },
            questions: vec![question],
            answers: vec![],
        }
    }

    /// Builds the reply to `query` carrying `answers`.
    ///
    /// Unknown opcodes are answered with NOTIMP (RFC 1035 section 4.1.1),
    /// but whatever answers were collected are still returned.
    pub fn response(query: &Message, answers: Vec<ResourceRecord>) -> Self {
        let response_code = match query.header.opcode {
            OpCode::StandardQuery => ResponseCode::NoError,
            _ => ResponseCode::NotImplemented,
        };

        let header = Header {
            id: query.header.id,
            qr: Qr::Response,
            opcode: query.header.opcode,
            authoritative_answer: false,
            truncated: false,
            recursion_desired: query.header.recursion_desired,
            // we never recurse on our own
            recursion_available: false,
            response_code,
            qd_count: query.questions.len() as u16,
            an_count: answers.len() as u16,
            ns_count: 0,
            ar_count: 0,
        };

        Self {
            header,
            questions: query.questions.clone(),
            answers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    pub id: u16,
    pub qr: Qr,
    pub opcode: OpCode,
    pub authoritative_answer: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub response_code: ResponseCode,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl Header {
    /// Packs the second header word. The reserved Z bits are always zero.
    ///
    /// ```text
    ///   15  14-11  10   9    8    7   6-4   3-0
    ///   QR  OPCODE AA   TC   RD   RA   Z   RCODE
    /// ```
    pub fn flags(&self) -> u16 {
        let mut flags: u16 = 0;
        flags |= (u16::from(self.qr) << 15) & 0b1000000000000000;
        flags |= (u16::from(u8::from(self.opcode)) << 11) & 0b0111100000000000;
        flags |= ((self.authoritative_answer as u16) << 10) & 0b0000010000000000;
        flags |= ((self.truncated as u16) << 9) & 0b0000001000000000;
        flags |= ((self.recursion_desired as u16) << 8) & 0b0000000100000000;
        flags |= ((self.recursion_available as u16) << 7) & 0b0000000010000000;
        flags |= u16::from(u8::from(self.response_code)) & 0b0000000000001111;
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: DomainName,
    pub query_type: QueryType,
    pub query_class: QueryClass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: DomainName,
    pub record_type: QueryType,
    pub class: QueryClass,
    pub ttl: i32,
    pub data: RData,
}

impl ResourceRecord {
    pub fn address(name: DomainName, class: QueryClass, ttl: i32, addr: Ipv4Addr) -> Self {
        Self {
            name,
            record_type: QueryType::A,
            class,
            ttl,
            data: RData::A(addr),
        }
    }
}

/// Resource data. Only address records are interpreted, everything else is
/// carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Opaque(Vec<u8>),
}

impl RData {
    pub fn len(&self) -> usize {
        match self {
            RData::A(_) => 4,
            RData::Opaque(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses the textual form of an IPv4 address used for address records.
pub fn parse_address(text: &str) -> Result<Ipv4Addr, Error> {
    text.trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(text.to_string()))
}

/// A domain name as a sequence of labels, case preserved.
///
/// Labels are raw octets between 1 and 63 bytes long; the root name has no
/// labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DomainName(Vec<Vec<u8>>);

impl DomainName {
    pub fn root() -> Self {
        Self(vec![])
    }

    pub fn from_labels<I, S>(labels: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let labels = labels.into_iter().map(Into::into).collect::<Vec<Vec<u8>>>();

        if labels
            .iter()
            .any(|l| l.is_empty() || l.len() > MAX_LABEL_LEN)
        {
            return Err(Error::MalformedName);
        }

        Ok(Self(labels))
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for DomainName {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.strip_suffix('.').unwrap_or(name);
        if name.is_empty() {
            return Ok(Self::root());
        }

        Self::from_labels(name.split('.'))
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }

        let labels: Vec<_> = self.0.iter().map(|l| String::from_utf8_lossy(l)).collect();
        f.write_str(&labels.join("."))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Qr {
    #[default]
    Query,
    Response,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum OpCode {
    #[default]
    StandardQuery,
    InversQuery,
    ServerStatusRequest,
    Reserved(u8),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ResponseCode {
    #[default]
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Unassigned(u8),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueryType {
    A,
    NS,
    MX,
    SOA,
    AAAA,
    CNAME,
    ALL,
    Unknown(u16),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueryClass {
    IN,
    CS,
    CH,
    HS,
    Unknown(u16),
}

impl From<&Message> for Vec<u8> {
    /// Serializes header, questions and answers in that order.
    ///
    /// The header is written as is: callers must keep `qd_count` and
    /// `an_count` in line with `questions` and `answers`, they are not
    /// recomputed here.
    fn from(message: &Message) -> Self {
        let mut raw_message: Vec<u8> = (&message.header).into();

        for question in &message.questions {
            raw_message.extend(Vec::<u8>::from(question));
        }

        for rr in &message.answers {
            raw_message.extend(Vec::<u8>::from(rr));
        }

        raw_message
    }
}

impl From<&Header> for Vec<u8> {
    fn from(header: &Header) -> Self {
        let mut raw_header = Vec::with_capacity(HEADER_LEN);

        raw_header.put_u16(header.id);
        raw_header.put_u16(header.flags());
        raw_header.put_u16(header.qd_count);
        raw_header.put_u16(header.an_count);
        raw_header.put_u16(header.ns_count);
        raw_header.put_u16(header.ar_count);

        raw_header
    }
}

impl From<&Question> for Vec<u8> {
    fn from(question: &Question) -> Self {
        let mut raw: Vec<u8> = (&question.name).into();

        raw.put_u16(question.query_type.into());
        raw.put_u16(question.query_class.into());

        raw
    }
}

impl From<&ResourceRecord> for Vec<u8> {
    fn from(rr: &ResourceRecord) -> Self {
        let mut raw_rr: Vec<u8> = (&rr.name).into();

        raw_rr.put_u16(rr.record_type.into());
        raw_rr.put_u16(rr.class.into());
        raw_rr.put_i32(rr.ttl);

        // decoded rdata never exceeds u16::MAX octets
        raw_rr.put_u16(rr.data.len() as u16);
        match &rr.data {
            RData::A(addr) => raw_rr.put_slice(&addr.octets()),
            RData::Opaque(data) => raw_rr.put_slice(data),
        }

        raw_rr
    }
}

impl From<&DomainName> for Vec<u8> {
    /// Uncompressed wire form: length prefixed labels and a null terminator.
    fn from(name: &DomainName) -> Self {
        let mut raw_name = Vec::new();

        for label in name.labels() {
            raw_name.put_u8(label.len() as u8);
            raw_name.put_slice(label);
        }
        raw_name.put_u8(0);

        raw_name
    }
}

impl From<u8> for Qr {
    fn from(value: u8) -> Self {
        if value == 1 {
            Qr::Response
        } else {
            Qr::Query
        }
    }
}

impl From<Qr> for u16 {
    fn from(value: Qr) -> Self {
        match value {
            Qr::Response => 1,
            Qr::Query => 0,
        }
    }
}

impl From<u8> for OpCode {
    fn from(code: u8) -> Self {
        match code {
            0 => OpCode::StandardQuery,
            1 => OpCode::InversQuery,
            2 => OpCode::ServerStatusRequest,
            v => OpCode::Reserved(v),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(code: OpCode) -> Self {
        match code {
            OpCode::StandardQuery => 0,
            OpCode::InversQuery => 1,
            OpCode::ServerStatusRequest => 2,
            OpCode::Reserved(code) => code,
        }
    }
}

impl From<u8> for ResponseCode {
    fn from(code: u8) -> Self {
        match code {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            c => ResponseCode::Unassigned(c),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(value: ResponseCode) -> Self {
        match value {
            ResponseCode::NoError => 0,
            ResponseCode::FormatError => 1,
            ResponseCode::ServerFailure => 2,
            ResponseCode::NameError => 3,
            ResponseCode::NotImplemented => 4,
            ResponseCode::Refused => 5,
            ResponseCode::Unassigned(c) => c,
        }
    }
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryType::A,
            2 => QueryType::NS,
            //NOTE: 3 and 4 Obsolete
            5 => QueryType::CNAME,
            6 => QueryType::SOA,
            // NOTE: [7, 8, 9, 10] experiemental
            15 => QueryType::MX,
            28 => QueryType::AAAA,
            255 => QueryType::ALL,
            t => QueryType::Unknown(t),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(value: QueryType) -> u16 {
        match value {
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::SOA => 6,
            QueryType::MX => 15,
            QueryType::AAAA => 28,
            QueryType::ALL => 255,
            QueryType::Unknown(t) => t,
        }
    }
}

impl From<u16> for QueryClass {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryClass::IN,
            2 => QueryClass::CS,
            3 => QueryClass::CH,
            4 => QueryClass::HS,
            c => QueryClass::Unknown(c),
        }
    }
}

impl From<QueryClass> for u16 {
    fn from(value: QueryClass) -> Self {
        match value {
            QueryClass::IN => 1,
            QueryClass::CS => 2,
            QueryClass::CH => 3,
            QueryClass::HS => 4,
            QueryClass::Unknown(c) => c,
        }
    }
}
