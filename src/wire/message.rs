//! The RAINS data model: messages, sections, objects, signatures.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::token::Token;

//----------- ZoneName / Context ------------------------------------------------

/// A name-space prefix under the authoritative control of some key, e.g.
/// `"ch"`, or `"."` for the root zone.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneName(pub Box<str>);

impl fmt::Display for ZoneName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ZoneName {
    fn from(s: &str) -> Self {
        ZoneName(s.into())
    }
}

/// A disambiguator allowing multiple simultaneous name-spaces; `"."` is the
/// default context.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Context(pub Box<str>);

impl Context {
    pub fn default_context() -> Self {
        Context(".".into())
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Context {
    fn from(s: &str) -> Self {
        Context(s.into())
    }
}

//----------- IpSubnet -----------------------------------------------------------

/// An IP address together with a network prefix length, used to key
/// address-scoped sections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpSubnet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpSubnet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }
}

impl Ord for IpSubnet {
    fn cmp(&self, other: &Self) -> Ordering {
        // Compare by network-prefix first, then by the full address
        // lexicographically.
        self.prefix_len
            .cmp(&other.prefix_len)
            .then_with(|| ip_bytes(self.addr).cmp(&ip_bytes(other.addr)))
    }
}

impl PartialOrd for IpSubnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn ip_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

impl fmt::Display for IpSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

//----------- SignatureAlgorithm / KeySpace --------------------------------------

/// A signature or public-key algorithm.
///
/// `Ed448` is accepted at the type level but currently returns an unsupported
/// error at sign/verify time; no available crate offers it yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Ed25519,
    Ed448,
    EcdsaP256Sha256,
    EcdsaP384Sha384,
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::Ed448 => "ed448",
            SignatureAlgorithm::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            SignatureAlgorithm::EcdsaP384Sha384 => "ecdsa-p384-sha384",
        })
    }
}

/// The key space a signature or key belongs to.
///
/// RAINS reserves room for external (non-RAINS) key spaces; only the RAINS
/// key space is given meaning by this specification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeySpace {
    Rains,
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeySpace::Rains => "rains",
        })
    }
}

//----------- SignatureData ------------------------------------------------------

/// The opaque payload of a signature.
///
/// Modeled as a tagged union so downstream code never needs dynamic casting
/// to recover the raw bytes a given algorithm produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureData {
    /// An empty signature. Verifies to `false` unconditionally.
    Empty,
    /// A raw Ed25519/Ed448 signature.
    EdBytes(Bytes),
    /// An ECDSA signature as a big-endian-encoded `(r, s)` pair.
    EcdsaPair { r: Bytes, s: Bytes },
}

impl SignatureData {
    pub fn is_empty(&self) -> bool {
        matches!(self, SignatureData::Empty)
    }
}

//----------- Signature -----------------------------------------------------------

/// A signature covering a section or a whole message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub key_space: KeySpace,
    pub algorithm: SignatureAlgorithm,
    pub key_phase: u32,
    pub valid_since: i64,
    pub valid_until: i64,
    pub data: SignatureData,
}

impl Signature {
    /// The metadata string appended verbatim to canonical bytes before
    /// hashing.
    pub fn metadata(&self) -> String {
        format!(
            "{} {} {} {}",
            self.key_space, self.algorithm, self.valid_since, self.valid_until
        )
    }

    pub fn overlaps(&self, other_since: i64, other_until: i64) -> bool {
        self.valid_since <= other_until && other_since <= self.valid_until
    }
}

//----------- PublicKey ------------------------------------------------------------

/// A public key, as carried by a delegation or infrastructure-key object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub algorithm: SignatureAlgorithm,
    pub key_phase: u32,
    pub valid_since: i64,
    pub valid_until: i64,
    pub key: Bytes,
}

//----------- ServiceInfo / Certificate -------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: Box<str>,
    pub port: u16,
    pub priority: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub cert_type: u8,
    pub usage: u8,
    pub hash_algorithm: u8,
    pub data: Bytes,
}

//----------- Object ----------------------------------------------------------------

/// A tagged value attached to an assertion's subject name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Object {
    Name(Box<str>),
    Ip4(std::net::Ipv4Addr),
    Ip6(std::net::Ipv6Addr),
    Redirection(Box<str>),
    Delegation(PublicKey),
    NameSet(Box<str>),
    Certificate(Certificate),
    ServiceInfo(ServiceInfo),
    Registrar(Box<str>),
    Registrant(Box<str>),
    InfraKey(PublicKey),
    ExtraKey(PublicKey),
    NextKey(PublicKey),
}

/// The discriminant of an [`Object`], used by [`Query`] to request specific
/// object types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Name,
    Ip4,
    Ip6,
    Redirection,
    Delegation,
    NameSet,
    Certificate,
    ServiceInfo,
    Registrar,
    Registrant,
    InfraKey,
    ExtraKey,
    NextKey,
}

impl Object {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Object::Name(_) => ObjectType::Name,
            Object::Ip4(_) => ObjectType::Ip4,
            Object::Ip6(_) => ObjectType::Ip6,
            Object::Redirection(_) => ObjectType::Redirection,
            Object::Delegation(_) => ObjectType::Delegation,
            Object::NameSet(_) => ObjectType::NameSet,
            Object::Certificate(_) => ObjectType::Certificate,
            Object::ServiceInfo(_) => ObjectType::ServiceInfo,
            Object::Registrar(_) => ObjectType::Registrar,
            Object::Registrant(_) => ObjectType::Registrant,
            Object::InfraKey(_) => ObjectType::InfraKey,
            Object::ExtraKey(_) => ObjectType::ExtraKey,
            Object::NextKey(_) => ObjectType::NextKey,
        }
    }

    /// The public key carried by a key-bearing object, if any.
    pub fn as_public_key(&self) -> Option<&PublicKey> {
        match self {
            Object::Delegation(key) | Object::InfraKey(key) | Object::ExtraKey(key) | Object::NextKey(key) => {
                Some(key)
            }
            _ => None,
        }
    }
}

//----------- Assertion -------------------------------------------------------------

/// A signed statement binding a name in a zone/context to one or more
/// objects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub subject_zone: ZoneName,
    pub context: Context,
    pub subject_name: Box<str>,
    pub objects: Vec<Object>,
    pub signatures: Vec<Signature>,
}

impl Assertion {
    /// The effective validity window across all of this assertion's
    /// signatures, before any key-window or max-validity capping.
    pub fn signature_window(&self) -> Option<(i64, i64)> {
        self.signatures
            .iter()
            .map(|s| (s.valid_since, s.valid_until))
            .reduce(|(a_since, a_until), (b_since, b_until)| {
                (a_since.max(b_since), a_until.min(b_until))
            })
    }
}

//----------- Shard / Pshard ---------------------------------------------------------

/// A signed lexicographic range of assertions, proving completeness within
/// the range. `""` denotes negative or positive infinity for the
/// corresponding endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub subject_zone: ZoneName,
    pub context: Context,
    pub range_from: Box<str>,
    pub range_to: Box<str>,
    pub content: Vec<Assertion>,
    pub signatures: Vec<Signature>,
}

impl Shard {
    /// Whether `name` falls within `[range_from, range_to)`, treating `""`
    /// endpoints as infinities.
    pub fn range_contains(&self, name: &str) -> bool {
        let after_from = self.range_from.is_empty() || name >= &*self.range_from;
        let before_to = self.range_to.is_empty() || name < &*self.range_to;
        after_from && before_to
    }
}

/// The hash family and mode of operation of a [`Pshard`]'s Bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomMode {
    Standard,
    KirschMitzenmacher1,
    KirschMitzenmacher2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomHash {
    Sha256,
    Sha512,
}

/// A shard summarized by a Bloom filter, rather than an explicit assertion
/// list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pshard {
    pub subject_zone: ZoneName,
    pub context: Context,
    pub range_from: Box<str>,
    pub range_to: Box<str>,
    pub hash_family: Vec<BloomHash>,
    pub num_hashes: u32,
    pub mode: BloomMode,
    pub filter: Bytes,
    pub signatures: Vec<Signature>,
}

//----------- Zone --------------------------------------------------------------------

/// A section contained within a [`Zone`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneContent {
    Assertion(Assertion),
    Shard(Shard),
    Pshard(Pshard),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub subject_zone: ZoneName,
    pub context: Context,
    pub content: Vec<ZoneContent>,
    pub signatures: Vec<Signature>,
}

//----------- Address-scoped sections --------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssertion {
    pub subject_addr: IpSubnet,
    pub context: Context,
    pub objects: Vec<Object>,
    pub signatures: Vec<Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressZone {
    pub subject_addr: IpSubnet,
    pub context: Context,
    pub content: Vec<AddressAssertion>,
    pub signatures: Vec<Signature>,
}

//----------- Query / AddressQuery --------------------------------------------------------

/// An option flag attached to a query, signaling a preference or constraint
/// to the answering server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryOption {
    MinE2ELatency,
    MinLastHopAnswerSize,
    MinInfoLeakage,
    CachedAnswersOnly,
    ExpiredAssertionsOk,
    TokenTracing,
    NoVerificationDelegation,
    NoProactiveCaching,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub name: Box<str>,
    pub context: Context,
    pub expiration: i64,
    pub types: Vec<ObjectType>,
    pub options: Vec<QueryOption>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressQuery {
    pub subject_addr: IpSubnet,
    pub context: Context,
    pub expiration: i64,
    pub types: Vec<ObjectType>,
    pub options: Vec<QueryOption>,
}

//----------- Notification --------------------------------------------------------------

/// A notification code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NotificationCode {
    Heartbeat = 100,
    CapHashNotKnown = 399,
    BadMessage = 400,
    RcvInconsistentMsg = 403,
    NoAssertionsExist = 404,
    MsgTooLarge = 413,
    UnspecServerErr = 500,
    ServerNotCapable = 501,
    NoAssertionAvail = 504,
}

impl NotificationCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub token: Token,
    pub code: NotificationCode,
    pub data: Box<str>,
}

//----------- Capability ------------------------------------------------------------------

/// An advertised peer capability, e.g. `urn:x-rains:tlssrv`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability(pub Box<str>);

impl Capability {
    pub const TLS_OVER_TCP: &'static str = "urn:x-rains:tlssrv";

    pub fn tls_over_tcp() -> Self {
        Capability(Self::TLS_OVER_TCP.into())
    }

    /// Parse the `h:<hex>` stand-in a peer sends in place of its full
    /// capability list back into the 32-byte hash it names.
    pub fn as_hash_stub(&self) -> Option<[u8; 32]> {
        let hex = self.0.strip_prefix("h:")?;
        if hex.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(out)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//----------- Section ------------------------------------------------------------------------

/// The discriminant of a [`Section`].
///
/// The declaration order below IS the total order on section kinds
/// (`AddressQuery, AddressZone, AddressAssertion, Assertion, Shard, Zone,
/// Query, Notification`); `derive(Ord)` compares enums by declaration order
/// first, so this enum doubles as the comparator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    AddressQuery,
    AddressZone,
    AddressAssertion,
    Assertion,
    Shard,
    Zone,
    Query,
    Notification,
}

/// One of the eight RAINS section variants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Section {
    AddressQuery(AddressQuery),
    AddressZone(AddressZone),
    AddressAssertion(AddressAssertion),
    Assertion(Assertion),
    Shard(Shard),
    Zone(Zone),
    Query(Query),
    Notification(Notification),
}

impl Section {
    pub fn kind(&self) -> SectionKind {
        match self {
            Section::AddressQuery(_) => SectionKind::AddressQuery,
            Section::AddressZone(_) => SectionKind::AddressZone,
            Section::AddressAssertion(_) => SectionKind::AddressAssertion,
            Section::Assertion(_) => SectionKind::Assertion,
            Section::Shard(_) => SectionKind::Shard,
            Section::Zone(_) => SectionKind::Zone,
            Section::Query(_) => SectionKind::Query,
            Section::Notification(_) => SectionKind::Notification,
        }
    }

    /// The signatures covering a signable section, if any. Unsigned
    /// sections (`Query`, `AddressQuery`, `Notification`) return `None`.
    pub fn signatures(&self) -> Option<&[Signature]> {
        match self {
            Section::AddressZone(z) => Some(&z.signatures),
            Section::AddressAssertion(a) => Some(&a.signatures),
            Section::Assertion(a) => Some(&a.signatures),
            Section::Shard(s) => Some(&s.signatures),
            Section::Zone(z) => Some(&z.signatures),
            Section::AddressQuery(_) | Section::Query(_) | Section::Notification(_) => None,
        }
    }

    pub fn signatures_mut(&mut self) -> Option<&mut Vec<Signature>> {
        match self {
            Section::AddressZone(z) => Some(&mut z.signatures),
            Section::AddressAssertion(a) => Some(&mut a.signatures),
            Section::Assertion(a) => Some(&mut a.signatures),
            Section::Shard(s) => Some(&mut s.signatures),
            Section::Zone(z) => Some(&mut z.signatures),
            Section::AddressQuery(_) | Section::Query(_) | Section::Notification(_) => None,
        }
    }

    pub fn context(&self) -> Option<&Context> {
        match self {
            Section::AddressQuery(q) => Some(&q.context),
            Section::AddressZone(z) => Some(&z.context),
            Section::AddressAssertion(a) => Some(&a.context),
            Section::Assertion(a) => Some(&a.context),
            Section::Shard(s) => Some(&s.context),
            Section::Zone(z) => Some(&z.context),
            Section::Query(q) => Some(&q.context),
            Section::Notification(_) => None,
        }
    }

    pub fn subject_zone(&self) -> Option<&ZoneName> {
        match self {
            Section::Assertion(a) => Some(&a.subject_zone),
            Section::Shard(s) => Some(&s.subject_zone),
            Section::Zone(z) => Some(&z.subject_zone),
            _ => None,
        }
    }

    pub fn is_signable(&self) -> bool {
        self.signatures().is_some()
    }
}

//----------- Message ----------------------------------------------------------------------

/// A complete RAINS message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub token: Token,
    pub sections: Vec<Section>,
    pub signatures: Vec<Signature>,
    pub capabilities: Vec<Capability>,
}

impl Message {
    pub fn new(token: Token) -> Self {
        Message {
            token,
            sections: Vec::new(),
            signatures: Vec::new(),
            capabilities: Vec::new(),
        }
    }
}
