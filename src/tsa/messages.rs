//! RFC 3161 message structures and their DER forms
//!
//! Both directions are implemented: the client encodes requests and decodes
//! responses, and the reverse pair is what a test authority needs.

use chrono::{DateTime, Utc};

use super::der::{self, DerError, Element, Reader, Result, tag};
use crate::digest::HashAlgorithm;

pub const OID_SIGNED_DATA: &str = "1.2.840.113549.1.7.2";
pub const OID_TST_INFO: &str = "1.2.840.113549.1.9.16.1.4";

/// `MessageImprint`: the hashed document and the algorithm that hashed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageImprint {
    pub algorithm_oid: String,
    pub digest: Vec<u8>,
}

impl MessageImprint {
    pub fn new(algorithm: HashAlgorithm, digest: Vec<u8>) -> Self {
        Self {
            algorithm_oid: algorithm.oid().to_string(),
            digest,
        }
    }

    fn to_der(&self) -> Result<Vec<u8>> {
        Ok(der::sequence(&[
            der::algorithm_identifier(&self.algorithm_oid)?,
            der::octet_string(&self.digest),
        ]))
    }

    fn from_element(element: Element<'_>) -> Result<Self> {
        let mut fields = element.expect(tag::SEQUENCE)?.children();
        let algorithm = fields.expect(tag::SEQUENCE)?;
        let algorithm_oid = algorithm.children().expect(tag::OID)?.as_oid()?;
        let digest = fields.next_element()?.octets()?;
        Ok(Self {
            algorithm_oid,
            digest,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeStampReq {
    pub imprint: MessageImprint,
    pub policy: Option<String>,
    /// Unsigned big-endian nonce value
    pub nonce: Option<Vec<u8>>,
    pub cert_req: bool,
}

impl TimeStampReq {
    /// Request with a fresh random 64-bit nonce and `certReq` set.
    pub fn new(algorithm: HashAlgorithm, digest: Vec<u8>, policy: Option<String>) -> Self {
        Self {
            imprint: MessageImprint::new(algorithm, digest),
            policy,
            nonce: Some(random_nonce()),
            cert_req: true,
        }
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        let mut fields = vec![der::integer(1), self.imprint.to_der()?];
        if let Some(policy) = &self.policy {
            fields.push(der::oid(policy)?);
        }
        if let Some(nonce) = &self.nonce {
            fields.push(der::unsigned_integer(nonce));
        }
        if self.cert_req {
            fields.push(der::boolean(true));
        }
        Ok(der::sequence(&fields))
    }

    pub fn from_der(data: &[u8]) -> Result<Self> {
        let mut fields = der::parse(data)?.expect(tag::SEQUENCE)?.children();
        let version = fields.expect(tag::INTEGER)?.as_u64()?;
        if version != 1 {
            return Err(DerError::Invalid(format!("unsupported request version {}", version)));
        }
        let imprint = MessageImprint::from_element(fields.next_element()?)?;
        let policy = fields.optional(tag::OID)?.map(|e| e.as_oid()).transpose()?;
        let nonce = fields
            .optional(tag::INTEGER)?
            .map(|e| e.unsigned_bytes().map(<[u8]>::to_vec))
            .transpose()?;
        let cert_req = fields
            .optional(tag::BOOLEAN)?
            .map(|e| e.as_bool())
            .transpose()?
            .unwrap_or(false);
        Ok(Self {
            imprint,
            policy,
            nonce,
            cert_req,
        })
    }
}

/// Eight random bytes with the top bit cleared, so the INTEGER stays
/// positive without padding.
fn random_nonce() -> Vec<u8> {
    let mut bytes = uuid::Uuid::new_v4().as_bytes()[..8].to_vec();
    bytes[0] &= 0x7F;
    if bytes[0] == 0 {
        bytes[0] = 0x01;
    }
    bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkiStatus {
    Granted,
    GrantedWithMods,
    Rejection,
    Waiting,
    RevocationWarning,
    RevocationNotification,
    Unknown(u64),
}

impl PkiStatus {
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => PkiStatus::Granted,
            1 => PkiStatus::GrantedWithMods,
            2 => PkiStatus::Rejection,
            3 => PkiStatus::Waiting,
            4 => PkiStatus::RevocationWarning,
            5 => PkiStatus::RevocationNotification,
            other => PkiStatus::Unknown(other),
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            PkiStatus::Granted => 0,
            PkiStatus::GrantedWithMods => 1,
            PkiStatus::Rejection => 2,
            PkiStatus::Waiting => 3,
            PkiStatus::RevocationWarning => 4,
            PkiStatus::RevocationNotification => 5,
            PkiStatus::Unknown(code) => *code,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, PkiStatus::Granted | PkiStatus::GrantedWithMods)
    }
}

impl std::fmt::Display for PkiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PkiStatus::Granted => f.write_str("granted"),
            PkiStatus::GrantedWithMods => f.write_str("grantedWithMods"),
            PkiStatus::Rejection => f.write_str("rejection"),
            PkiStatus::Waiting => f.write_str("waiting"),
            PkiStatus::RevocationWarning => f.write_str("revocationWarning"),
            PkiStatus::RevocationNotification => f.write_str("revocationNotification"),
            PkiStatus::Unknown(code) => write!(f, "status {}", code),
        }
    }
}

/// Name of a `PKIFailureInfo` bit.
pub fn failure_name(bit: u32) -> &'static str {
    match bit {
        0 => "badAlg",
        2 => "badRequest",
        5 => "badDataFormat",
        14 => "timeNotAvailable",
        15 => "unacceptedPolicy",
        16 => "unacceptedExtension",
        17 => "addInfoNotAvailable",
        25 => "systemFailure",
        _ => "unknownFailure",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiStatusInfo {
    pub status: PkiStatus,
    pub text: Vec<String>,
    /// Set `PKIFailureInfo` bit positions
    pub failures: Vec<u32>,
}

impl PkiStatusInfo {
    pub fn granted() -> Self {
        Self {
            status: PkiStatus::Granted,
            text: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn rejection(text: &str, failures: Vec<u32>) -> Self {
        Self {
            status: PkiStatus::Rejection,
            text: vec![text.to_string()],
            failures,
        }
    }

    /// One-line description: status, free text and failure names.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.status.to_string()];
        if !self.text.is_empty() {
            parts.push(self.text.join("; "));
        }
        if !self.failures.is_empty() {
            let names: Vec<&str> = self.failures.iter().map(|&b| failure_name(b)).collect();
            parts.push(format!("[{}]", names.join(", ")));
        }
        parts.join(": ")
    }

    fn to_der(&self) -> Vec<u8> {
        let mut fields = vec![der::integer(self.status.code())];
        if !self.text.is_empty() {
            let texts: Vec<Vec<u8>> = self.text.iter().map(|t| der::utf8_string(t)).collect();
            fields.push(der::sequence(&texts));
        }
        if !self.failures.is_empty() {
            let highest = self.failures.iter().copied().max().unwrap_or(0) as usize;
            let mut bits = vec![0u8; highest / 8 + 1];
            for &bit in &self.failures {
                bits[bit as usize / 8] |= 0x80 >> (bit % 8);
            }
            let unused = (7 - highest % 8) as u8;
            let mut content = vec![unused];
            content.extend_from_slice(&bits);
            fields.push(der::tlv(tag::BIT_STRING, &content));
        }
        der::sequence(&fields)
    }

    fn from_element(element: Element<'_>) -> Result<Self> {
        let mut fields = element.expect(tag::SEQUENCE)?.children();
        let status = PkiStatus::from_code(fields.expect(tag::INTEGER)?.as_u64()?);

        let mut text = Vec::new();
        if let Some(free_text) = fields.optional(tag::SEQUENCE)? {
            let mut strings = free_text.children();
            while !strings.is_empty() {
                text.push(strings.next_element()?.as_text()?);
            }
        }

        let mut failures = Vec::new();
        if let Some(bits) = fields.optional(tag::BIT_STRING)? {
            if let Some((_, body)) = bits.content.split_first() {
                for (index, byte) in body.iter().enumerate() {
                    for offset in 0..8 {
                        if byte & (0x80 >> offset) != 0 {
                            failures.push((index * 8 + offset) as u32);
                        }
                    }
                }
            }
        }

        Ok(Self {
            status,
            text,
            failures,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeStampResp {
    pub status: PkiStatusInfo,
    /// DER of the `TimeStampToken` (a CMS ContentInfo), when present
    pub token: Option<Vec<u8>>,
}

impl TimeStampResp {
    pub fn granted(token: Vec<u8>) -> Self {
        Self {
            status: PkiStatusInfo::granted(),
            token: Some(token),
        }
    }

    pub fn to_der(&self) -> Vec<u8> {
        let mut fields = vec![self.status.to_der()];
        if let Some(token) = &self.token {
            fields.push(token.clone());
        }
        der::sequence(&fields)
    }

    pub fn from_der(data: &[u8]) -> Result<Self> {
        let outer = der::parse(data)?.expect(tag::SEQUENCE)?;
        let mut fields = outer.children();
        let status = PkiStatusInfo::from_element(fields.next_element()?)?;
        let token = fields
            .optional(tag::SEQUENCE)?
            .map(|element| element.raw.to_vec());
        Ok(Self { status, token })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accuracy {
    pub seconds: u64,
    pub millis: u64,
    pub micros: u64,
}

/// Decoded `TSTInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TstInfo {
    pub policy: String,
    pub imprint: MessageImprint,
    /// Unsigned big-endian serial number
    pub serial: Vec<u8>,
    pub gen_time: DateTime<Utc>,
    pub accuracy: Option<Accuracy>,
    pub ordering: bool,
    pub nonce: Option<Vec<u8>>,
}

impl TstInfo {
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let mut fields = vec![
            der::integer(1),
            der::oid(&self.policy)?,
            self.imprint.to_der()?,
            der::unsigned_integer(&self.serial),
            der::generalized_time(&self.gen_time),
        ];
        if let Some(accuracy) = &self.accuracy {
            let mut parts = Vec::new();
            if accuracy.seconds > 0 {
                parts.push(der::integer(accuracy.seconds));
            }
            if accuracy.millis > 0 {
                let mut millis = der::integer(accuracy.millis);
                millis[0] = tag::context(0, false);
                parts.push(millis);
            }
            if accuracy.micros > 0 {
                let mut micros = der::integer(accuracy.micros);
                micros[0] = tag::context(1, false);
                parts.push(micros);
            }
            fields.push(der::sequence(&parts));
        }
        if self.ordering {
            fields.push(der::boolean(true));
        }
        if let Some(nonce) = &self.nonce {
            fields.push(der::unsigned_integer(nonce));
        }
        Ok(der::sequence(&fields))
    }

    pub fn from_der(data: &[u8]) -> Result<Self> {
        let mut fields = der::parse(data)?.expect(tag::SEQUENCE)?.children();
        let version = fields.expect(tag::INTEGER)?.as_u64()?;
        if version != 1 {
            return Err(DerError::Invalid(format!("unsupported TSTInfo version {}", version)));
        }
        let policy = fields.expect(tag::OID)?.as_oid()?;
        let imprint = MessageImprint::from_element(fields.next_element()?)?;
        let serial = fields.expect(tag::INTEGER)?.unsigned_bytes()?.to_vec();
        let gen_time = fields.expect(tag::GENERALIZED_TIME)?.as_generalized_time()?;
        let accuracy = fields
            .optional(tag::SEQUENCE)?
            .map(read_accuracy)
            .transpose()?;
        let ordering = fields
            .optional(tag::BOOLEAN)?
            .map(|e| e.as_bool())
            .transpose()?
            .unwrap_or(false);
        let nonce = fields
            .optional(tag::INTEGER)?
            .map(|e| e.unsigned_bytes().map(<[u8]>::to_vec))
            .transpose()?;
        // tsa [0] and extensions [1] are not interpreted

        Ok(Self {
            policy,
            imprint,
            serial,
            gen_time,
            accuracy,
            ordering,
            nonce,
        })
    }
}

fn read_accuracy(element: Element<'_>) -> Result<Accuracy> {
    let mut accuracy = Accuracy {
        seconds: 0,
        millis: 0,
        micros: 0,
    };
    let mut fields = element.children();
    while !fields.is_empty() {
        let field = fields.next_element()?;
        let value = field
            .content
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        match field.tag {
            tag::INTEGER => accuracy.seconds = value,
            t if t == tag::context(0, false) => accuracy.millis = value,
            t if t == tag::context(1, false) => accuracy.micros = value,
            _ => {}
        }
    }
    Ok(accuracy)
}

/// What the CMS envelope of a timestamp token carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedContent {
    pub tst_info: Vec<u8>,
    pub has_certificates: bool,
    pub signer_count: usize,
}

/// Unwrap ContentInfo → SignedData → encapsulated TSTInfo octets.
pub fn parse_signed_data(content_info: &[u8]) -> Result<SignedContent> {
    let mut outer = der::parse(content_info)?.expect(tag::SEQUENCE)?.children();
    let content_type = outer.expect(tag::OID)?.as_oid()?;
    if content_type != OID_SIGNED_DATA {
        return Err(DerError::Invalid(format!(
            "token content type is {}, expected signedData",
            content_type
        )));
    }
    let wrapper = outer.expect(tag::context(0, true))?;
    let signed_data = wrapper.children().expect(tag::SEQUENCE)?;

    let mut fields = signed_data.children();
    fields.expect(tag::INTEGER)?;
    fields.expect(tag::SET)?;

    let mut encapsulated = fields.expect(tag::SEQUENCE)?.children();
    let econtent_type = encapsulated.expect(tag::OID)?.as_oid()?;
    if econtent_type != OID_TST_INFO {
        return Err(DerError::Invalid(format!(
            "encapsulated content type is {}, expected TSTInfo",
            econtent_type
        )));
    }
    let econtent = encapsulated
        .optional(tag::context(0, true))?
        .ok_or_else(|| DerError::Invalid("token carries no TSTInfo".into()))?;
    let tst_info = econtent.children().next_element()?.octets()?;

    let has_certificates = fields.optional(tag::context(0, true))?.is_some();
    fields.optional(tag::context(1, true))?;
    let signer_count = match fields.optional(tag::SET)? {
        Some(signers) => count_elements(signers.children())?,
        None => 0,
    };

    Ok(SignedContent {
        tst_info,
        has_certificates,
        signer_count,
    })
}

fn count_elements(mut reader: Reader<'_>) -> Result<usize> {
    let mut count = 0;
    while !reader.is_empty() {
        reader.next_element()?;
        count += 1;
    }
    Ok(count)
}

/// Wrap encoded TSTInfo in an unsigned SignedData ContentInfo. Real
/// authorities add certificates and a signer; clients here do not check them.
pub fn encapsulate_tst_info(tst_info: &[u8]) -> Result<Vec<u8>> {
    let encapsulated = der::sequence(&[
        der::oid(OID_TST_INFO)?,
        der::explicit(0, &der::octet_string(tst_info)),
    ]);
    let signed_data = der::sequence(&[
        der::integer(3),
        der::set(&[der::algorithm_identifier(HashAlgorithm::Sha256.oid())?]),
        encapsulated,
        der::set(&[]),
    ]);
    Ok(der::sequence(&[
        der::oid(OID_SIGNED_DATA)?,
        der::explicit(0, &signed_data),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_info(nonce: Option<Vec<u8>>) -> TstInfo {
        TstInfo {
            policy: "1.2.3.4.1".into(),
            imprint: MessageImprint::new(HashAlgorithm::Sha256, vec![7; 32]),
            serial: vec![0x01, 0x02],
            gen_time: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            accuracy: Some(Accuracy {
                seconds: 1,
                millis: 500,
                micros: 0,
            }),
            ordering: false,
            nonce,
        }
    }

    #[test]
    fn test_request_encoding_layout() {
        let request = TimeStampReq {
            imprint: MessageImprint::new(HashAlgorithm::Sha256, vec![0xAA; 32]),
            policy: None,
            nonce: Some(vec![0x12, 0x34]),
            cert_req: true,
        };
        let encoded = request.to_der().unwrap();
        let parsed = TimeStampReq::from_der(&encoded).unwrap();
        assert_eq!(parsed, request);
        // version, imprint, nonce, certReq
        assert_eq!(&encoded[2..5], &[0x02, 0x01, 0x01]);
        assert!(encoded.ends_with(&[0x02, 0x02, 0x12, 0x34, 0x01, 0x01, 0xFF]));
    }

    #[test]
    fn test_fresh_requests_use_distinct_positive_nonces() {
        let a = TimeStampReq::new(HashAlgorithm::Sha256, vec![1; 32], None);
        let b = TimeStampReq::new(HashAlgorithm::Sha256, vec![1; 32], None);
        let (na, nb) = (a.nonce.unwrap(), b.nonce.unwrap());
        assert_eq!(na.len(), 8);
        assert!(na[0] & 0x80 == 0 && na[0] != 0);
        assert_ne!(na, nb);
        assert!(a.cert_req);
    }

    #[test]
    fn test_token_envelope_round_trip() {
        let info = sample_info(Some(vec![9, 9, 9]));
        let token = encapsulate_tst_info(&info.to_der().unwrap()).unwrap();
        let content = parse_signed_data(&token).unwrap();
        assert_eq!(content.signer_count, 0);
        assert!(!content.has_certificates);
        assert_eq!(TstInfo::from_der(&content.tst_info).unwrap(), info);
    }

    #[test]
    fn test_rejection_status_is_described() {
        let response = TimeStampResp {
            status: PkiStatusInfo::rejection("policy not accepted", vec![15]),
            token: None,
        };
        let parsed = TimeStampResp::from_der(&response.to_der()).unwrap();
        assert_eq!(parsed.status.status, PkiStatus::Rejection);
        assert_eq!(parsed.status.failures, vec![15]);
        assert_eq!(
            parsed.status.describe(),
            "rejection: policy not accepted: [unacceptedPolicy]"
        );
        assert!(parsed.token.is_none());
    }

    #[test]
    fn test_wrong_content_type_is_rejected() {
        let bogus = der::sequence(&[der::oid("1.2.840.113549.1.7.1").unwrap(), der::explicit(0, &der::null())]);
        assert!(parse_signed_data(&bogus).is_err());
    }
}
