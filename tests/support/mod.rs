//! Shared fixtures: small PDF documents and an in-process mock TSA

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::Utc;

use timeseal::pdf::writer::{self, XrefRecord};
use timeseal::pdf::Dictionary;
use timeseal::tsa::http::REPLY_CONTENT_TYPE;
use timeseal::tsa::messages::{
    MessageImprint, PkiStatusInfo, TimeStampReq, TimeStampResp, TstInfo, encapsulate_tst_info,
};

/// Write `objects` with a classic xref table and a trailer.
pub fn build_pdf(objects: &[(u32, String)], trailer_extra: &str) -> Vec<u8> {
    let mut data = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = BTreeMap::new();
    for (number, body) in objects {
        offsets.insert(*number, data.len());
        data.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", number, body).as_bytes());
    }
    let size = offsets.keys().next_back().copied().unwrap_or(0) + 1;
    let xref = data.len();
    data.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f\r\n", size).as_bytes());
    for number in 1..size {
        match offsets.get(&number) {
            Some(offset) => data.extend_from_slice(format!("{:010} 00000 n\r\n", offset).as_bytes()),
            None => data.extend_from_slice(b"0000000000 00000 f\r\n"),
        }
    }
    data.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R {} >>\nstartxref\n{}\n%%EOF\n",
            size, trailer_extra, xref
        )
        .as_bytes(),
    );
    data
}

fn page_objects(pages: usize, first: u32) -> Vec<(u32, String)> {
    let mut objects = Vec::new();
    for i in 0..pages as u32 {
        let page = first + 2 * i;
        let content = page + 1;
        let text = format!("BT /F1 12 Tf 72 720 Td (Page {}) Tj ET", i + 1);
        objects.push((
            page,
            format!("<< /Type /Page /Parent 2 0 R /Contents {} 0 R >>", content),
        ));
        objects.push((
            content,
            format!("<< /Length {} >>\nstream\n{}\nendstream", text.len(), text),
        ));
    }
    objects
}

fn kids(pages: usize, first: u32) -> String {
    (0..pages as u32)
        .map(|i| format!("{} 0 R", first + 2 * i))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A well-formed document with `pages` pages.
pub fn simple_pdf(pages: usize) -> Vec<u8> {
    let mut objects = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>".to_string()),
        (
            2,
            format!(
                "<< /Type /Pages /Kids [{}] /Count {} /MediaBox [0 0 612 792] >>",
                kids(pages, 3),
                pages
            ),
        ),
    ];
    objects.extend(page_objects(pages, 3));
    build_pdf(&objects, "")
}

/// One page and an existing signature field named `TimestampSignature`.
pub fn pdf_with_timestamp_field() -> Vec<u8> {
    let mut objects = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R /AcroForm 20 0 R >>".to_string()),
        (
            2,
            "<< /Type /Pages /Kids [3 0 R] /Count 1 /MediaBox [0 0 612 792] >>".to_string(),
        ),
        (20, "<< /Fields [21 0 R] /SigFlags 3 >>".to_string()),
        (
            21,
            "<< /FT /Sig /T (TimestampSignature) /Rect [0 0 0 0] /P 3 0 R >>".to_string(),
        ),
    ];
    objects.extend(page_objects(1, 3));
    build_pdf(&objects, "")
}

/// Two pages with a `startxref` that points nowhere.
pub fn broken_startxref_pdf() -> Vec<u8> {
    let mut data = simple_pdf(2);
    let at = rfind(&data, b"startxref").unwrap_or(data.len());
    data.truncate(at);
    data.extend_from_slice(b"startxref\n987654\n%%EOF\n");
    data
}

/// One page, with an `/Encrypt` dictionary in the trailer.
pub fn encrypted_pdf() -> Vec<u8> {
    let mut objects = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>".to_string()),
        (
            2,
            "<< /Type /Pages /Kids [3 0 R] /Count 1 /MediaBox [0 0 612 792] >>".to_string(),
        ),
        (
            10,
            "<< /Filter /Standard /V 2 /R 3 /Length 128 /O <00> /U <00> /P -4 >>".to_string(),
        ),
    ];
    objects.extend(page_objects(1, 3));
    build_pdf(&objects, "/Encrypt 10 0 R /ID [<0102> <0102>]")
}

/// One page whose catalog, page tree and page live in an object stream,
/// with a `startxref` that points nowhere. `count` overrides the stream's /N.
pub fn object_stream_pdf(count: Option<&str>) -> Vec<u8> {
    let bodies = [
        "<< /Type /Catalog /Pages 2 0 R >>",
        "<< /Type /Pages /Kids [3 0 R] /Count 1 /MediaBox [0 0 612 792] >>",
        "<< /Type /Page /Parent 2 0 R >>",
    ];
    let mut header = String::new();
    let mut members = String::new();
    for (i, body) in bodies.iter().enumerate() {
        header.push_str(&format!("{} {} ", i + 1, members.len()));
        members.push_str(body);
        members.push(' ');
    }
    let content = format!("{}{}", header, members);
    format!(
        "%PDF-1.5\n4 0 obj\n<< /Type /ObjStm /N {} /First {} /Length {} >>\nstream\n{}\nendstream\nendobj\ntrailer\n<< /Size 5 /Root 1 0 R >>\nstartxref\n999999\n%%EOF\n",
        count.unwrap_or("3"),
        header.len(),
        content.len(),
        content
    )
    .into_bytes()
}

/// A valid-looking file whose catalog nests `depth` arrays.
pub fn deeply_nested_pdf(depth: usize) -> Vec<u8> {
    let catalog = format!(
        "<< /Type /Catalog /Pages 2 0 R /Deep {}{} >>",
        "[".repeat(depth),
        "]".repeat(depth)
    );
    let mut objects = vec![
        (1, catalog),
        (
            2,
            "<< /Type /Pages /Kids [3 0 R] /Count 1 /MediaBox [0 0 612 792] >>".to_string(),
        ),
    ];
    objects.extend(page_objects(1, 3));
    build_pdf(&objects, "")
}

/// Bytes that are not a PDF at all.
pub fn garbage() -> Vec<u8> {
    b"This is a plain text file that merely claims to be a PDF.\n".repeat(20)
}

/// One page indexed by an uncompressed cross-reference stream.
pub fn xref_stream_pdf() -> Vec<u8> {
    let mut data = b"%PDF-1.5\n".to_vec();
    let mut records = Vec::new();
    let mut objects = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>".to_string()),
        (
            2,
            "<< /Type /Pages /Kids [3 0 R] /Count 1 /MediaBox [0 0 612 792] >>".to_string(),
        ),
    ];
    objects.extend(page_objects(1, 3));
    for (number, body) in &objects {
        records.push(XrefRecord {
            number: *number,
            generation: 0,
            offset: data.len(),
        });
        data.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", number, body).as_bytes());
    }

    let mut trailer = Dictionary::new();
    trailer.set(b"Size", 6i64);
    trailer.set(b"Root", (1u32, 0u16));
    let at = writer::write_xref_stream(&mut data, (5, 0), &records, &[], trailer);
    data.extend_from_slice(format!("startxref\n{}\n%%EOF\n", at).as_bytes());
    data
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// How the mock authority answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behaviour {
    #[default]
    Grant,
    WrongNonce,
    WrongDigest,
    Reject,
    Garbage,
    /// HTTP 500 with an empty body
    Status500,
    /// Never answers within any sane timeout
    Hang,
}

#[derive(Clone)]
struct MockState {
    /// Behaviour per request in arrival order; the last one repeats
    script: Arc<Vec<Behaviour>>,
    requests: Arc<Mutex<Vec<TimeStampReq>>>,
    serial: Arc<AtomicU64>,
}

pub struct MockTsa {
    pub url: String,
    requests: Arc<Mutex<Vec<TimeStampReq>>>,
}

impl MockTsa {
    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<TimeStampReq> {
        self.requests.lock().unwrap().clone()
    }
}

/// Start a mock TSA on an ephemeral local port.
pub async fn start_mock_tsa(behaviour: Behaviour) -> MockTsa {
    start_scripted_tsa(vec![behaviour]).await
}

/// Start a mock TSA that answers the n-th request with `script[n]`.
pub async fn start_scripted_tsa(script: Vec<Behaviour>) -> MockTsa {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        script: Arc::new(script),
        requests: requests.clone(),
        serial: Arc::new(AtomicU64::new(1)),
    };

    let app = Router::new()
        .route("/", post(timestamp).get(|| async { "timeseal mock TSA" }))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let bound_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockTsa {
        url: format!("http://{}/", bound_addr),
        requests,
    }
}

async fn timestamp(State(state): State<MockState>, body: Bytes) -> Response {
    let Ok(request) = TimeStampReq::from_der(&body) else {
        return (StatusCode::BAD_REQUEST, "malformed TimeStampReq").into_response();
    };
    let behaviour = {
        let mut requests = state.requests.lock().unwrap();
        requests.push(request.clone());
        let n = requests.len() - 1;
        state
            .script
            .get(n)
            .or(state.script.last())
            .copied()
            .unwrap_or_default()
    };

    let reply = match behaviour {
        Behaviour::Status500 => {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Behaviour::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return StatusCode::GATEWAY_TIMEOUT.into_response();
        }
        Behaviour::Garbage => b"<html>definitely not DER</html>".to_vec(),
        Behaviour::Reject => TimeStampResp {
            status: PkiStatusInfo::rejection("policy not accepted", vec![15]),
            token: None,
        }
        .to_der(),
        behaviour => {
            let mut digest = request.imprint.digest.clone();
            if behaviour == Behaviour::WrongDigest {
                digest[0] ^= 0xFF;
            }
            let nonce = match behaviour {
                Behaviour::WrongNonce => Some(vec![0x01, 0x02, 0x03, 0x04]),
                _ => request.nonce.clone(),
            };
            let serial = state.serial.fetch_add(1, Ordering::SeqCst);
            let info = TstInfo {
                policy: "1.3.6.1.4.1.601.10.3.1".to_string(),
                imprint: MessageImprint {
                    algorithm_oid: request.imprint.algorithm_oid.clone(),
                    digest,
                },
                serial: serial.to_be_bytes().to_vec(),
                gen_time: Utc::now(),
                accuracy: None,
                ordering: false,
                nonce,
            };
            let token = encapsulate_tst_info(&info.to_der().unwrap()).unwrap();
            TimeStampResp::granted(token).to_der()
        }
    };

    ([(header::CONTENT_TYPE, REPLY_CONTENT_TYPE)], reply).into_response()
}
