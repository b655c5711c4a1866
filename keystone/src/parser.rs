// src/parser.rs

/// Requests carrying more headers than this are invalid.
pub const MAX_HEADERS: usize = 100;

const EMPTY_PAIR: (&str, &[u8]) = ("", &[]);

/// One parsed request. Every field borrows from the bytes handed to
/// `parse`; nothing here owns memory, and the borrows die with the next
/// consume or reset of the read buffer.
pub struct Request<'b> {
    pub method: &'b str,
    pub path: &'b str,
    pub query: Option<&'b str>,
    pub minor_version: u8,
    pub headers: [(&'b str, &'b [u8]); MAX_HEADERS],
    pub header_count: usize,
    pub body: &'b [u8],
}

pub enum ParseOutcome<'b> {
    /// A full request (head plus `Content-Length` body) is buffered.
    /// `consumed` is the byte count to drop once the response is out.
    Complete { req: Request<'b>, consumed: usize },
    /// Keep reading; the request is not fully buffered yet.
    Incomplete,
    /// Malformed. Answer 400 and close.
    Invalid,
}

/// Adapt the push-mode tokenizer to a streaming receive buffer. Bodies
/// are framed strictly by `Content-Length`; chunked uploads are refused
/// so pipelined framing stays sound.
pub fn parse(buf: &[u8]) -> ParseOutcome<'_> {
    if buf.is_empty() {
        return ParseOutcome::Incomplete;
    }

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseOutcome::Incomplete,
        Err(_) => return ParseOutcome::Invalid,
    };

    let mut content_len = 0usize;
    let mut headers = [EMPTY_PAIR; MAX_HEADERS];
    let mut header_count = 0usize;

    for h in parsed.headers.iter() {
        if h.name.eq_ignore_ascii_case("content-length") {
            match std::str::from_utf8(h.value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
            {
                Some(n) => content_len = n,
                None => return ParseOutcome::Invalid,
            }
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            return ParseOutcome::Invalid;
        }
        headers[header_count] = (h.name, h.value);
        header_count += 1;
    }

    let total = match head_len.checked_add(content_len) {
        Some(t) => t,
        None => return ParseOutcome::Invalid,
    };
    if buf.len() < total {
        return ParseOutcome::Incomplete;
    }

    let (method, target) = match (parsed.method, parsed.path) {
        (Some(m), Some(p)) => (m, p),
        _ => return ParseOutcome::Invalid,
    };
    let (path, query) = match target.find('?') {
        Some(i) => (&target[..i], Some(&target[i + 1..])),
        None => (target, None),
    };

    ParseOutcome::Complete {
        req: Request {
            method,
            path,
            query,
            minor_version: parsed.version.unwrap_or(1),
            headers,
            header_count,
            body: &buf[head_len..total],
        },
        consumed: total,
    }
}
