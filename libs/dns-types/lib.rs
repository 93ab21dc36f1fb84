#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::borrow::Cow;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use domain::{
    base::{
        HeaderCounts, Message, MessageBuilder, ParsedName, Question, RecordSection,
        message_builder::AnswerBuilder, name::FlattenInto,
    },
    dep::octseq::OctetsInto,
    rdata::AllRecordData,
};
use serde::{Deserialize, Serialize};
use url::Url;

pub mod prelude {
    // Re-export trait names so other crates can call the functions on them.
    // We don't export the name though so that it cannot conflict.
    pub use domain::base::RecordData as _;
    pub use domain::base::ToName as _;
    pub use domain::base::name::FlattenInto as _;
}

pub const MAX_NAME_LEN: usize = domain::base::Name::MAX_LEN;

/// Payload limit for UDP replies to clients that did not advertise one via EDNS0.
pub const MIN_UDP_PAYLOAD: u16 = 512;

pub type RecordType = domain::base::iana::Rtype;
pub type Ttl = domain::base::Ttl;

pub type DomainNameRef<'a> = domain::base::Name<&'a [u8]>;
pub type Record<'a> =
    domain::base::Record<ParsedName<&'a [u8]>, AllRecordData<&'a [u8], ParsedName<&'a [u8]>>>;
pub type RecordData<'a> = AllRecordData<&'a [u8], ParsedName<&'a [u8]>>;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

pub type ResponseCode = domain::base::iana::Rcode;

#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.inner.header().id())
            .field("type", &self.qtype())
            .field("domain", &self.domain())
            .finish()
    }
}

impl Query {
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if message.header().qr() {
            return Err(Error::NotAQuery);
        }

        // We don't need to support multiple questions in a single query because
        // nobody sends them and resolvers reject them anyway.
        //
        // See: https://stackoverflow.com/a/55093896
        let _ = message.sole_question()?;

        // Verify that we can parse all records (EDNS0 OPT lives in the additional section).
        for record in message.additional()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn new(domain: DomainName, rtype: RecordType) -> Self {
        let mut inner = MessageBuilder::new_vec().question();
        inner.header_mut().set_qr(false);
        inner.header_mut().set_rd(true); // Default to recursion desired.
        inner.header_mut().set_random_id(); // Default to a random id.

        inner
            .push((domain, rtype))
            .expect("Vec-backed message builder never fails");

        Self {
            inner: inner.into_message(),
        }
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    /// The maximum reply size this client can take over UDP.
    ///
    /// Clients advertise a payload size via EDNS0; without an OPT record the
    /// classic 512-byte limit applies.
    pub fn max_udp_payload(&self) -> u16 {
        self.inner
            .opt()
            .map(|opt| opt.udp_payload_size())
            .unwrap_or(MIN_UDP_PAYLOAD)
            .max(MIN_UDP_PAYLOAD)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    /// Converts this query into a DNS-over-HTTPS POST request.
    pub fn try_into_doh_request(self, url: &DohUrl) -> Result<http::Request<Bytes>, http::Error> {
        let query = self.with_id(0); // In order to be more HTTP-cache friendly, DoH queries should set their ID to 0.

        http::Request::builder()
            .method(http::Method::POST)
            .uri(url.as_str())
            .header(http::header::CONTENT_TYPE, "application/dns-message")
            .header(http::header::ACCEPT, "application/dns-message")
            .body(Bytes::from(query.into_bytes()))
    }

    /// Converts this query into a DNS-over-HTTPS GET request.
    ///
    /// Useful against servers that reject POST; the wire format is identical.
    pub fn try_into_doh_get_request(
        self,
        url: &DohUrl,
    ) -> Result<http::Request<Bytes>, http::Error> {
        let query = self.with_id(0);

        let uri = format!(
            "{url}?dns={}",
            BASE64_URL_SAFE_NO_PAD.encode(query.as_bytes())
        );

        http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .header(http::header::ACCEPT, "application/dns-message")
            .body(Bytes::new())
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }
}

impl TryFrom<&[u8]> for Query {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

#[derive(Clone)]
pub struct Response {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.inner.header().id())
            .field("domain", &self.domain())
            .field("type", &self.qtype())
            .field("response_code", &self.response_code())
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Creates an empty, "NOERROR" response for the given query.
    pub fn no_error(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NOERROR).build()
    }

    pub fn servfail(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::SERVFAIL).build()
    }

    pub fn nxdomain(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NXDOMAIN).build()
    }

    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }

        let _ = message.sole_question()?;

        // Verify that we can parse all records in all sections.
        for record in message.answer()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }
        for record in message.authority()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }
        for record in message.additional()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn try_from_http_response(response: http::Response<Bytes>) -> Result<Self, Error> {
        if response.status() != http::StatusCode::OK {
            let status = response.status();
            let body = String::from_utf8(response.into_body().into()).unwrap_or_default();

            return Err(Error::HttpNotSuccess(status, body));
        }

        if response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .is_none_or(|ct| ct != "application/dns-message")
        {
            return Err(Error::NotApplicationDnsMessage);
        }

        Self::parse(response.body())
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn truncated(&self) -> bool {
        self.inner.header().tc()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    pub fn answer_count(&self) -> u16 {
        self.inner.header_counts().ancount()
    }

    /// Whether the reply carries any answer or authority records.
    pub fn carries_records(&self) -> bool {
        let counts = self.inner.header_counts();

        counts.ancount() > 0 || counts.nscount() > 0
    }

    pub fn ttl(&self, rtype: RecordType) -> Option<Duration> {
        self.records()
            .filter(|r| r.rtype() == rtype)
            .map(|r| r.ttl().into_duration())
            .min()
    }

    /// The smallest TTL across all answer records.
    pub fn min_ttl(&self) -> Option<Ttl> {
        self.records().map(|r| r.ttl()).min()
    }

    /// The TTL a negative answer may be cached for, derived from the SOA
    /// record in the authority section per RFC 2308: the smaller of the SOA
    /// record's own TTL and its MINIMUM field.
    pub fn negative_ttl(&self) -> Option<Ttl> {
        self.authority_records().find_map(|r| {
            let rr_ttl = r.ttl();

            match r.into_data() {
                AllRecordData::Soa(soa) => Some(rr_ttl.min(soa.minimum())),
                _ => None,
            }
        })
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        Self::section_records(self.answer())
    }

    pub fn authority_records(&self) -> impl Iterator<Item = Record<'_>> {
        Self::section_records(self.inner.authority().expect("verified in ctor"))
    }

    pub fn additional_records(&self) -> impl Iterator<Item = Record<'_>> {
        Self::section_records(self.inner.additional().expect("verified in ctor"))
    }

    fn section_records<'a>(
        section: RecordSection<'a, Vec<u8>>,
    ) -> impl Iterator<Item = Record<'a>> {
        section.into_iter().map(|r| {
            r.expect("verified in ctor")
                .into_any_record::<AllRecordData<_, _>>()
                .expect("verified in ctor")
        })
    }

    /// Creates a copy of this response with every record's TTL set to `ttl`
    /// and the header id set to `id`, preserving rcode, flags and all record
    /// sections. The EDNS0 OPT pseudo-record keeps its TTL field, which
    /// encodes flags rather than a lifetime.
    pub fn for_serving(&self, ttl: Ttl, id: u16) -> Response {
        let mut answer = MessageBuilder::new_vec()
            .start_answer(&self.inner, self.response_code())
            .expect("Vec-backed message builder never fails");

        {
            let header = answer.header_mut();
            let original = self.inner.header();
            header.set_id(id);
            header.set_aa(original.aa());
            header.set_rd(original.rd());
            header.set_ra(original.ra());
        }

        for record in self.records() {
            answer
                .push(rewrite_ttl(record, ttl))
                .expect("Vec-backed message builder never fails");
        }

        let mut authority = answer.authority();
        for record in self.authority_records() {
            authority
                .push(rewrite_ttl(record, ttl))
                .expect("Vec-backed message builder never fails");
        }

        let mut additional = authority.additional();
        for record in self.additional_records() {
            let record = if record.rtype() == RecordType::OPT {
                into_owned(record)
            } else {
                rewrite_ttl(record, ttl)
            };

            additional
                .push(record)
                .expect("Vec-backed message builder never fails");
        }

        Response {
            inner: additional.into_message(),
        }
    }

    /// Serializes this response into a byte slice.
    ///
    /// The `max_len` parameter specifies the maximum size of the payload.
    /// In case the payload is bigger than `max_len`, it will be truncated and the TC bit in the header will be set.
    pub fn into_bytes(mut self, max_len: u16) -> Vec<u8> {
        let qid = self.inner.header().id();

        let len = self.inner.as_slice().len();
        if len <= max_len as usize {
            return self.inner.into_octets();
        }

        tracing::debug!(%len, %max_len, %qid, domain = %self.domain(), "Truncating DNS response");

        self.inner.header_mut().set_tc(true);

        let start_of_answer = self.answer().pos();

        let mut bytes = self.inner.into_octets();
        bytes.truncate(start_of_answer);

        let headercounts = HeaderCounts::for_message_slice_mut(&mut bytes);

        // We deleted everything after answers, reset all counts to 0.
        headercounts.as_slice_mut().fill(0);

        // Set the question count to 1.
        headercounts.set_qdcount(1);

        bytes
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }

    fn answer(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.answer().expect("verified in ctor")
    }
}

fn into_owned(record: Record<'_>) -> OwnedRecord {
    OwnedRecord::new(
        record.owner().flatten_into(),
        record.class(),
        record.ttl(),
        record.into_data().flatten_into(),
    )
}

fn rewrite_ttl(record: Record<'_>, ttl: Ttl) -> OwnedRecord {
    OwnedRecord::new(
        record.owner().flatten_into(),
        record.class(),
        ttl,
        record.into_data().flatten_into(),
    )
}

/// A minimal FORMERR reply for a datagram we could not parse beyond its header.
///
/// Echoes only the 16-bit id; there is no question section to copy.
pub fn formerr_bytes(id: u16) -> Vec<u8> {
    let mut builder = MessageBuilder::new_vec().answer();
    builder.header_mut().set_id(id);
    builder.header_mut().set_qr(true);
    builder.header_mut().set_rcode(ResponseCode::FORMERR);

    builder.into_message().into_octets()
}

pub struct ResponseBuilder {
    inner: AnswerBuilder<Vec<u8>>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        let inner = MessageBuilder::new_vec()
            .start_answer(&query.inner, code)
            .expect("Vec-backed message builder never fails");

        Self { inner }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        for record in records {
            self.inner
                .push(record.into())
                .expect("Vec-backed message builder never fails");
        }

        self
    }

    /// Marks the response as coming from an authoritative source.
    pub fn authoritative(mut self) -> Self {
        self.inner.header_mut().set_aa(true);

        self
    }

    pub fn build(self) -> Response {
        Response {
            inner: self.inner.into_message(),
        }
    }

    /// Finishes the response with records in the authority section, e.g. an
    /// SOA on a negative answer.
    pub fn build_with_authority(
        self,
        records: impl IntoIterator<Item: Into<OwnedRecord>>,
    ) -> Response {
        let mut authority = self.inner.authority();

        for record in records {
            authority
                .push(record.into())
                .expect("Vec-backed message builder never fails");
        }

        Response {
            inner: authority.into_message(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bytes slice is too short to contain a message")]
    TooShort,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error("HTTP response is not 200: {0} {1}")]
    HttpNotSuccess(http::StatusCode, String),
    #[error("HTTP response Content-Type is not application/dns-message")]
    NotApplicationDnsMessage,
    #[error(transparent)]
    Parse(#[from] domain::base::wire::ParseError),
}

/// The URL of a DNS-over-HTTPS resolver endpoint.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DohUrl(Url);

impl DohUrl {
    pub fn host(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.0.host_str().expect("validated in ctor"))
    }

    pub fn port(&self) -> u16 {
        self.0.port().unwrap_or(443)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for DohUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for DohUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DohUrl {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::from_str(s).map_err(io::Error::other)?;

        if url.scheme() != "https" {
            return Err(io::Error::other("Only https scheme is allowed"));
        }

        if url.host_str().is_none() {
            return Err(io::Error::other("URL without host"));
        }

        if url.query().is_some() {
            return Err(io::Error::other("Query parameters are not allowed"));
        }

        Ok(Self(url))
    }
}

impl<'de> Deserialize<'de> for DohUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        String::deserialize(deserializer)?
            .parse::<Self>()
            .map_err(D::Error::custom)
    }
}

impl Serialize for DohUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.0.as_str())
    }
}

pub mod records {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use domain::base::Serial;
    use domain::rdata::{A, Aaaa, Soa};

    use super::*;

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    pub fn soa(mname: DomainName, rname: DomainName, minimum: Ttl) -> OwnedRecordData {
        OwnedRecordData::Soa(Soa::new(
            mname,
            rname,
            Serial::from(1),
            Ttl::from_secs(7200),
            Ttl::from_secs(900),
            Ttl::from_secs(86400),
            minimum,
        ))
    }

    pub fn extract_ip(r: Record<'_>) -> Option<IpAddr> {
        match r.data() {
            AllRecordData::A(a) => Some(IpAddr::from(a.addr())),
            AllRecordData::Aaaa(aaaa) => Some(IpAddr::from(aaaa.addr())),
            _ => None,
        }
    }

    /// Terminal address records with their TTLs, e.g. for route expiry.
    pub fn extract_ip_with_ttl(r: Record<'_>) -> Option<(IpAddr, Ttl)> {
        let ttl = r.ttl();

        extract_ip(r).map(|ip| (ip, ttl))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn example_query() -> Query {
        Query::new(domain("example.com"), RecordType::A)
    }

    fn domain(name: &str) -> DomainName {
        DomainName::vec_from_str(name).unwrap()
    }

    #[test]
    fn can_truncate_response() {
        let query = example_query();
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records(std::iter::repeat_n(
                (domain("example.com"), 1, records::a(Ipv4Addr::LOCALHOST)),
                1000,
            ))
            .build();

        let bytes = response.into_bytes(1000);

        let parsed_response = Response::parse(&bytes).unwrap();

        assert!(parsed_response.truncated());
        assert_eq!(parsed_response.records().count(), 0);
        assert_eq!(parsed_response.domain(), domain("example.com"));
    }

    #[test]
    fn max_udp_payload_without_edns_is_512() {
        assert_eq!(example_query().max_udp_payload(), 512);
    }

    #[test]
    fn for_serving_rewrites_all_ttls_and_id() {
        let query = example_query();
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records(vec![
                (domain("example.com"), 300, records::a(Ipv4Addr::LOCALHOST)),
                (
                    domain("example.com"),
                    600,
                    records::a(Ipv4Addr::new(192, 0, 2, 1)),
                ),
            ])
            .build();

        let served = response.for_serving(Ttl::from_secs(17), 0xabcd);

        assert_eq!(served.id(), 0xabcd);
        assert!(served.records().all(|r| r.ttl() == Ttl::from_secs(17)));
        assert_eq!(served.records().count(), 2);
        assert_eq!(served.response_code(), ResponseCode::NOERROR);
    }

    #[test]
    fn for_serving_preserves_rcode_and_authority() {
        let query = Query::new(domain("nope.test"), RecordType::A);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NXDOMAIN)
            .build_with_authority(std::iter::once((
                domain("test"),
                30,
                records::soa(domain("ns1.test"), domain("admin.test"), Ttl::from_secs(60)),
            )));

        let served = response.for_serving(Ttl::from_secs(9), 7);

        assert_eq!(served.response_code(), ResponseCode::NXDOMAIN);
        assert_eq!(served.authority_records().count(), 1);
        assert!(
            served
                .authority_records()
                .all(|r| r.ttl() == Ttl::from_secs(9))
        );
    }

    #[test]
    fn negative_ttl_is_min_of_soa_ttl_and_minimum() {
        let query = Query::new(domain("nope.test"), RecordType::A);

        let soa_ttl_wins = ResponseBuilder::for_query(&query, ResponseCode::NXDOMAIN)
            .build_with_authority(std::iter::once((
                domain("test"),
                30,
                records::soa(domain("ns1.test"), domain("admin.test"), Ttl::from_secs(60)),
            )));
        let minimum_wins = ResponseBuilder::for_query(&query, ResponseCode::NXDOMAIN)
            .build_with_authority(std::iter::once((
                domain("test"),
                600,
                records::soa(domain("ns1.test"), domain("admin.test"), Ttl::from_secs(45)),
            )));

        assert_eq!(soa_ttl_wins.negative_ttl(), Some(Ttl::from_secs(30)));
        assert_eq!(minimum_wins.negative_ttl(), Some(Ttl::from_secs(45)));
    }

    #[test]
    fn min_ttl_takes_smallest_answer() {
        let query = example_query();
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records(vec![
                (domain("example.com"), 1800, records::a(Ipv4Addr::LOCALHOST)),
                (
                    domain("example.com"),
                    120,
                    records::a(Ipv4Addr::new(192, 0, 2, 7)),
                ),
            ])
            .build();

        assert_eq!(response.min_ttl(), Some(Ttl::from_secs(120)));
    }

    #[test]
    fn formerr_bytes_parse_as_formerr() {
        let bytes = formerr_bytes(0x1234);

        let message = Message::from_octets(bytes.as_slice()).unwrap();

        assert_eq!(message.header().id(), 0x1234);
        assert!(message.header().qr());
        assert_eq!(message.header().rcode(), ResponseCode::FORMERR);
    }

    #[test]
    fn doh_request_carries_content_type_and_zero_id() {
        let url = "https://dns.example/dns-query".parse::<DohUrl>().unwrap();

        let request = example_query().try_into_doh_request(&url).unwrap();

        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/dns-message"
        );

        let query = Query::parse(request.body()).unwrap();
        assert_eq!(query.id(), 0);
    }

    #[test]
    fn doh_response_requires_content_type() {
        let response = http::Response::builder()
            .status(http::StatusCode::OK)
            .body(Bytes::new())
            .unwrap();

        let result = Response::try_from_http_response(response);

        assert!(matches!(result, Err(Error::NotApplicationDnsMessage)));
    }

    #[test]
    fn doh_url_rejects_plain_http() {
        assert!("http://dns.example/dns-query".parse::<DohUrl>().is_err());
    }
}
