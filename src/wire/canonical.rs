//! Deterministic byte encoding and the total order on sections.
//!
//! `encode_message`/`encode_section` are pure and collision-free: any two
//! inputs that should produce different signatures produce different byte
//! strings. Sorting is mandatory before signing and is the first action on
//! the receive path.

use std::cmp::Ordering;

use crate::wire::message::{
    AddressAssertion, AddressQuery, AddressZone, Assertion, IpSubnet, Message, Notification,
    Object, ObjectType, PublicKey, Pshard, Query, QueryOption, Section, Shard, Signature,
    SignatureData, Zone, ZoneContent,
};

//----------- Encoder --------------------------------------------------------------

/// An append-only byte buffer with length-prefixed primitives, used to build
/// the canonical byte form of a section or message.
#[derive(Default)]
pub struct Encoder(Vec<u8>);

impl Encoder {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// A length-prefixed byte string.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.0.extend_from_slice(v);
        self
    }

    pub fn str(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    /// A length-prefixed sequence, encoded element-by-element by `f`.
    pub fn seq<T>(&mut self, items: &[T], mut f: impl FnMut(&mut Self, &T)) -> &mut Self {
        self.u32(items.len() as u32);
        for item in items {
            f(self, item);
        }
        self
    }
}

//----------- Field-level canonical encoders ---------------------------------------

fn encode_public_key(enc: &mut Encoder, key: &PublicKey) {
    enc.u8(algorithm_tag(key.algorithm))
        .u32(key.key_phase)
        .i64(key.valid_since)
        .i64(key.valid_until)
        .bytes(&key.key);
}

fn algorithm_tag(algo: crate::wire::message::SignatureAlgorithm) -> u8 {
    use crate::wire::message::SignatureAlgorithm::*;
    match algo {
        Ed25519 => 0,
        Ed448 => 1,
        EcdsaP256Sha256 => 2,
        EcdsaP384Sha384 => 3,
    }
}

fn encode_object(enc: &mut Encoder, obj: &Object) {
    match obj {
        Object::Name(n) => enc.u8(0).str(n),
        Object::Ip4(ip) => enc.u8(1).bytes(&ip.octets()),
        Object::Ip6(ip) => enc.u8(2).bytes(&ip.octets()),
        Object::Redirection(n) => enc.u8(3).str(n),
        Object::Delegation(k) => {
            enc.u8(4);
            encode_public_key(enc, k);
            enc
        }
        Object::NameSet(n) => enc.u8(5).str(n),
        Object::Certificate(c) => enc
            .u8(6)
            .u8(c.cert_type)
            .u8(c.usage)
            .u8(c.hash_algorithm)
            .bytes(&c.data),
        Object::ServiceInfo(s) => enc.u8(7).str(&s.name).u16(s.port).u32(s.priority),
        Object::Registrar(n) => enc.u8(8).str(n),
        Object::Registrant(n) => enc.u8(9).str(n),
        Object::InfraKey(k) => {
            enc.u8(10);
            encode_public_key(enc, k);
            enc
        }
        Object::ExtraKey(k) => {
            enc.u8(11);
            encode_public_key(enc, k);
            enc
        }
        Object::NextKey(k) => {
            enc.u8(12);
            encode_public_key(enc, k);
            enc
        }
    };
}

fn encode_object_type(enc: &mut Encoder, t: &ObjectType) {
    enc.u8(*t as u8);
}

fn encode_query_option(enc: &mut Encoder, o: &QueryOption) {
    enc.u8(*o as u8);
}

fn encode_ip_subnet(enc: &mut Encoder, s: &IpSubnet) {
    match s.addr {
        std::net::IpAddr::V4(v4) => enc.u8(4).bytes(&v4.octets()),
        std::net::IpAddr::V6(v6) => enc.u8(6).bytes(&v6.octets()),
    };
    enc.u8(s.prefix_len);
}

/// The signature's own canonical bytes, excluding its opaque `data` (which is
/// the output of signing, not an input to it).
fn encode_signature_header(enc: &mut Encoder, sig: &Signature) {
    enc.u8(match sig.key_space {
        crate::wire::message::KeySpace::Rains => 0,
    })
    .u8(algorithm_tag(sig.algorithm))
    .u32(sig.key_phase)
    .i64(sig.valid_since)
    .i64(sig.valid_until);
}

fn encode_signatures(enc: &mut Encoder, sigs: &[Signature]) {
    enc.seq(sigs, |enc, sig| {
        encode_signature_header(enc, sig);
        match &sig.data {
            SignatureData::Empty => {
                enc.u8(0);
            }
            SignatureData::EdBytes(b) => {
                enc.u8(1).bytes(b);
            }
            SignatureData::EcdsaPair { r, s } => {
                enc.u8(2).bytes(r).bytes(s);
            }
        }
    });
}

fn encode_assertion(enc: &mut Encoder, a: &Assertion) {
    enc.str(&a.context.0)
        .str(&a.subject_zone.0)
        .str(&a.subject_name)
        .seq(&a.objects, encode_object);
}

fn encode_shard_body(enc: &mut Encoder, s: &Shard) {
    enc.str(&s.context.0)
        .str(&s.subject_zone.0)
        .str(&s.range_from)
        .str(&s.range_to)
        .seq(&s.content, encode_assertion);
}

fn encode_pshard_body(enc: &mut Encoder, p: &Pshard) {
    enc.str(&p.context.0)
        .str(&p.subject_zone.0)
        .str(&p.range_from)
        .str(&p.range_to)
        .u32(p.hash_family.len() as u32)
        .u32(p.num_hashes)
        .u8(match p.mode {
            crate::wire::message::BloomMode::Standard => 0,
            crate::wire::message::BloomMode::KirschMitzenmacher1 => 1,
            crate::wire::message::BloomMode::KirschMitzenmacher2 => 2,
        })
        .bytes(&p.filter);
}

fn encode_zone_content(enc: &mut Encoder, c: &ZoneContent) {
    match c {
        ZoneContent::Assertion(a) => {
            enc.u8(0);
            encode_assertion(enc, a);
        }
        ZoneContent::Shard(s) => {
            enc.u8(1);
            encode_shard_body(enc, s);
        }
        ZoneContent::Pshard(p) => {
            enc.u8(2);
            encode_pshard_body(enc, p);
        }
    }
}

fn encode_zone_body(enc: &mut Encoder, z: &Zone) {
    enc.str(&z.context.0)
        .str(&z.subject_zone.0)
        .seq(&z.content, encode_zone_content);
}

fn encode_address_assertion_body(enc: &mut Encoder, a: &AddressAssertion) {
    encode_ip_subnet(enc, &a.subject_addr);
    enc.str(&a.context.0).seq(&a.objects, encode_object);
}

fn encode_address_zone_body(enc: &mut Encoder, z: &AddressZone) {
    encode_ip_subnet(enc, &z.subject_addr);
    enc.str(&z.context.0)
        .seq(&z.content, encode_address_assertion_body);
}

fn encode_query_body(enc: &mut Encoder, q: &Query) {
    enc.str(&q.context.0)
        .str(&q.name)
        .i64(q.expiration)
        .seq(&q.types, encode_object_type)
        .seq(&q.options, encode_query_option);
}

fn encode_address_query_body(enc: &mut Encoder, q: &AddressQuery) {
    encode_ip_subnet(enc, &q.subject_addr);
    enc.str(&q.context.0)
        .i64(q.expiration)
        .seq(&q.types, encode_object_type)
        .seq(&q.options, encode_query_option);
}

fn encode_notification_body(enc: &mut Encoder, n: &Notification) {
    enc.bytes(n.token.as_bytes()).u16(n.code.code()).str(&n.data);
}

/// Canonical bytes for one section, not including its own signatures. This
/// is the input to signing/verifying that section.
pub fn encode_section_body(section: &Section) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u8(section_kind_tag(section));
    match section {
        Section::AddressQuery(q) => encode_address_query_body(&mut enc, q),
        Section::AddressZone(z) => encode_address_zone_body(&mut enc, z),
        Section::AddressAssertion(a) => encode_address_assertion_body(&mut enc, a),
        Section::Assertion(a) => encode_assertion(&mut enc, a),
        Section::Shard(s) => encode_shard_body(&mut enc, s),
        Section::Zone(z) => encode_zone_body(&mut enc, z),
        Section::Query(q) => encode_query_body(&mut enc, q),
        Section::Notification(n) => encode_notification_body(&mut enc, n),
    }
    enc.into_bytes()
}

fn section_kind_tag(section: &Section) -> u8 {
    section.kind() as u8
}

/// A section's full canonical bytes, including its signatures' metadata, for
/// use as the complete "this is what got signed" record (e.g. for hashing
/// or content-addressing a section independent of any message it arrived in).
pub fn encode_section(section: &Section) -> Vec<u8> {
    let mut bytes = encode_section_body(section);
    if let Some(sigs) = section.signatures() {
        let mut enc = Encoder::new();
        encode_signatures(&mut enc, sigs);
        bytes.extend(enc.into_bytes());
    }
    bytes
}

/// Canonical bytes for the whole message, appended signature metadata
/// included, as fed to the message-level signature primitive.
pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.bytes(message.token.as_bytes());
    enc.seq(&message.sections, |enc, section| {
        enc.bytes(&encode_section(section));
    });
    enc.seq(&message.capabilities, |enc, cap| {
        enc.str(&cap.0);
    });
    encode_signatures(&mut enc, &message.signatures);
    enc.into_bytes()
}

//----------- Total order on sections --------------------------------

/// Compare two range endpoints: `""` stands for `-∞` as a `range_from` and
/// `+∞` as a `range_to`.
fn compare_range_from(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

fn compare_range_to(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

fn compare_assertions(a: &Assertion, b: &Assertion) -> Ordering {
    a.context
        .cmp(&b.context)
        .then_with(|| a.subject_zone.cmp(&b.subject_zone))
        .then_with(|| a.subject_name.cmp(&b.subject_name))
        .then_with(|| encode_assertion_body(a).cmp(&encode_assertion_body(b)))
}

fn encode_assertion_body(a: &Assertion) -> Vec<u8> {
    let mut enc = Encoder::new();
    encode_assertion(&mut enc, a);
    enc.into_bytes()
}

fn compare_shards(a: &Shard, b: &Shard) -> Ordering {
    a.context
        .cmp(&b.context)
        .then_with(|| a.subject_zone.cmp(&b.subject_zone))
        .then_with(|| compare_range_from(&a.range_from, &b.range_from))
        .then_with(|| compare_range_to(&a.range_to, &b.range_to))
        .then_with(|| compare_sorted_contents(&a.content, &b.content))
}

fn compare_sorted_contents(a: &[Assertion], b: &[Assertion]) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| compare_assertions(x, y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn compare_zone_contents(a: &ZoneContent, b: &ZoneContent) -> Ordering {
    fn rank(c: &ZoneContent) -> u8 {
        match c {
            ZoneContent::Assertion(_) => 0,
            ZoneContent::Shard(_) => 1,
            ZoneContent::Pshard(_) => 2,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (ZoneContent::Assertion(x), ZoneContent::Assertion(y)) => compare_assertions(x, y),
        (ZoneContent::Shard(x), ZoneContent::Shard(y)) => compare_shards(x, y),
        (ZoneContent::Pshard(x), ZoneContent::Pshard(y)) => {
            compare_range_from(&x.range_from, &y.range_from)
                .then_with(|| compare_range_to(&x.range_to, &y.range_to))
        }
        _ => Ordering::Equal,
    })
}

fn compare_zones(a: &Zone, b: &Zone) -> Ordering {
    a.context
        .cmp(&b.context)
        .then_with(|| a.subject_zone.cmp(&b.subject_zone))
        .then_with(|| {
            a.content
                .iter()
                .zip(b.content.iter())
                .map(|(x, y)| compare_zone_contents(x, y))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or_else(|| a.content.len().cmp(&b.content.len()))
        })
}

fn compare_queries(a: &Query, b: &Query) -> Ordering {
    a.context
        .cmp(&b.context)
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.expiration.cmp(&b.expiration))
        .then_with(|| a.types.cmp(&b.types))
        .then_with(|| a.options.cmp(&b.options))
}

fn compare_notifications(a: &Notification, b: &Notification) -> Ordering {
    a.token
        .cmp(&b.token)
        .then_with(|| a.code.cmp(&b.code))
        .then_with(|| a.data.cmp(&b.data))
}

fn compare_address_assertions(a: &AddressAssertion, b: &AddressAssertion) -> Ordering {
    a.context
        .cmp(&b.context)
        .then_with(|| a.subject_addr.cmp(&b.subject_addr))
}

fn compare_address_zones(a: &AddressZone, b: &AddressZone) -> Ordering {
    a.context
        .cmp(&b.context)
        .then_with(|| a.subject_addr.cmp(&b.subject_addr))
}

fn compare_address_queries(a: &AddressQuery, b: &AddressQuery) -> Ordering {
    a.context
        .cmp(&b.context)
        .then_with(|| a.subject_addr.cmp(&b.subject_addr))
}

/// The total order on sections: first by section kind (the fixed enum
/// order), then by the per-kind natural key.
pub fn compare_sections(a: &Section, b: &Section) -> Ordering {
    a.kind().cmp(&b.kind()).then_with(|| match (a, b) {
        (Section::AddressQuery(x), Section::AddressQuery(y)) => compare_address_queries(x, y),
        (Section::AddressZone(x), Section::AddressZone(y)) => compare_address_zones(x, y),
        (Section::AddressAssertion(x), Section::AddressAssertion(y)) => {
            compare_address_assertions(x, y)
        }
        (Section::Assertion(x), Section::Assertion(y)) => compare_assertions(x, y),
        (Section::Shard(x), Section::Shard(y)) => compare_shards(x, y),
        (Section::Zone(x), Section::Zone(y)) => compare_zones(x, y),
        (Section::Query(x), Section::Query(y)) => compare_queries(x, y),
        (Section::Notification(x), Section::Notification(y)) => compare_notifications(x, y),
        _ => Ordering::Equal, // unreachable: `kind()` already differed
    })
}

/// Recursively sort the contents of a shard or zone, then sort the
/// top-level list of sections in a message. Idempotent: re-sorting an
/// already-sorted message is a no-op.
pub fn sort_message(message: &mut Message) {
    for section in &mut message.sections {
        sort_section_contents(section);
    }
    message.sections.sort_by(compare_sections);
}

fn sort_section_contents(section: &mut Section) {
    match section {
        Section::Shard(s) => s.content.sort_by(compare_assertions),
        Section::Zone(z) => z.content.sort_by(compare_zone_contents),
        Section::AddressZone(z) => z.content.sort_by(compare_address_assertions),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::*;

    fn assertion(name: &str) -> Assertion {
        Assertion {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            subject_name: name.into(),
            objects: vec![Object::Ip4(std::net::Ipv4Addr::new(1, 2, 3, 4))],
            signatures: vec![],
        }
    }

    #[test]
    fn sorting_is_idempotent() {
        let mut message = Message::new(Token::random());
        message.sections.push(Section::Assertion(assertion("b")));
        message.sections.push(Section::Assertion(assertion("a")));
        message.sections.push(Section::Notification(Notification {
            token: Token::random(),
            code: NotificationCode::Heartbeat,
            data: "".into(),
        }));

        sort_message(&mut message);
        let once = message.clone();
        sort_message(&mut message);
        assert_eq!(once, message);

        // Assertions (lower SectionKind ordinal) sort before Notification.
        assert!(matches!(message.sections[0], Section::Assertion(_)));
        assert!(matches!(message.sections[2], Section::Notification(_)));
    }

    #[test]
    fn section_kind_order_matches_spec() {
        let kinds = [
            SectionKind::AddressQuery,
            SectionKind::AddressZone,
            SectionKind::AddressAssertion,
            SectionKind::Assertion,
            SectionKind::Shard,
            SectionKind::Zone,
            SectionKind::Query,
            SectionKind::Notification,
        ];
        for pair in kinds.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn empty_range_endpoints_compare_as_infinities() {
        assert_eq!(compare_range_from("", "a"), Ordering::Less);
        assert_eq!(compare_range_to("", "a"), Ordering::Greater);
    }

    #[test]
    fn distinct_sections_encode_to_distinct_bytes() {
        let a = Section::Assertion(assertion("a"));
        let b = Section::Assertion(assertion("b"));
        assert_ne!(encode_section_body(&a), encode_section_body(&b));
    }
}
