// src/exchange.rs
use crate::parser::Request;
use crate::router::ParamArray;
use crate::view::ByteView;
use bumpalo::Bump;
use std::ptr;

/// The one object user script ever sees, rebound per request. Request
/// views point into the connection read buffer and are valid only while
/// the current handler invocation (and the serialization right after it)
/// runs; the response side is owned here and cleared with capacity
/// retained between requests.
pub struct ExchangeState {
    method: ByteView,
    path: ByteView,
    body: ByteView,
    req_headers: Vec<(ByteView, ByteView)>,
    params: ParamArray,
    params_dirty: bool,
    // Arena of the connection currently being served; null when idle.
    arena: *const Bump,
    pub status: u16,
    resp_headers: Vec<(String, String)>,
    resp_count: usize,
    resp_body: ByteView,
}

impl ExchangeState {
    pub fn new() -> Self {
        Self {
            method: ByteView::empty(),
            path: ByteView::empty(),
            body: ByteView::empty(),
            req_headers: Vec::with_capacity(32),
            params: ParamArray::new(),
            params_dirty: false,
            arena: ptr::null(),
            status: 200,
            resp_headers: Vec::new(),
            resp_count: 0,
            resp_body: ByteView::empty(),
        }
    }

    /// Point the exchange at the current request and reset the response
    /// side to its defaults.
    pub fn begin(&mut self, req: &Request<'_>, params: &ParamArray, arena: &Bump) {
        self.method = ByteView::new(req.method.as_bytes());
        self.path = ByteView::new(req.path.as_bytes());
        self.body = ByteView::new(req.body);

        self.req_headers.clear();
        for i in 0..req.header_count {
            let (name, value) = req.headers[i];
            self.req_headers
                .push((ByteView::new(name.as_bytes()), ByteView::new(value)));
        }

        self.params = *params;
        self.params_dirty = true;

        self.arena = arena as *const Bump;
        self.status = 200;
        self.resp_count = 0;
        self.resp_body = ByteView::empty();
    }

    /// Drop every borrowed view, the response body span included. Stale
    /// access after this yields empties instead of dangling reads.
    pub fn finish(&mut self) {
        self.method = ByteView::empty();
        self.path = ByteView::empty();
        self.body = ByteView::empty();
        self.req_headers.clear();
        self.params.clear();
        self.params_dirty = false;
        self.arena = ptr::null();
        self.resp_body = ByteView::empty();
    }

    #[inline]
    pub fn method_view(&self) -> ByteView {
        self.method
    }

    #[inline]
    pub fn path_view(&self) -> ByteView {
        self.path
    }

    #[inline]
    pub fn body_view(&self) -> ByteView {
        self.body
    }

    #[inline]
    pub fn params(&self) -> &ParamArray {
        &self.params
    }

    #[inline]
    pub fn params_dirty(&self) -> bool {
        self.params_dirty
    }

    pub fn mark_params_clean(&mut self) {
        self.params_dirty = false;
    }

    /// Case-insensitive scan of the request headers.
    pub fn find_request_header(&self, name: &[u8]) -> Option<ByteView> {
        self.req_headers
            .iter()
            .find(|(n, _)| unsafe { n.as_bytes() }.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// Case-insensitive scan of headers the script has set so far.
    pub fn find_response_header(&self, name: &[u8]) -> Option<ByteView> {
        self.resp_headers[..self.resp_count]
            .iter()
            .find(|(n, _)| n.as_bytes().eq_ignore_ascii_case(name))
            .map(|(_, v)| ByteView::new(v.as_bytes()))
    }

    /// Append a response header, reusing a cleared slot when one exists.
    pub fn push_response_header(&mut self, name: &[u8], value: &[u8]) {
        let name = String::from_utf8_lossy(name);
        let value = String::from_utf8_lossy(value);
        if self.resp_count < self.resp_headers.len() {
            let slot = &mut self.resp_headers[self.resp_count];
            slot.0.clear();
            slot.0.push_str(&name);
            slot.1.clear();
            slot.1.push_str(&value);
        } else {
            self.resp_headers
                .push((name.into_owned(), value.into_owned()));
        }
        self.resp_count += 1;
    }

    pub fn response_headers(&self) -> &[(String, String)] {
        &self.resp_headers[..self.resp_count]
    }

    /// Copy script-supplied body bytes into the connection arena. The
    /// copy happens before control returns to the script, so nothing the
    /// interpreter may collect is ever referenced afterwards.
    pub fn set_body_from(&mut self, bytes: &[u8]) {
        if self.arena.is_null() {
            return;
        }
        let arena = unsafe { &*self.arena };
        self.resp_body = ByteView::new(arena.alloc_slice_copy(bytes));
    }

    #[inline]
    pub fn response_body(&self) -> ByteView {
        self.resp_body
    }
}

impl Default for ExchangeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, ParseOutcome};

    fn with_request<F: FnOnce(&mut ExchangeState, &Bump)>(raw: &[u8], f: F) {
        let arena = Bump::new();
        let mut state = ExchangeState::new();
        let params = ParamArray::new();
        match parser::parse(raw) {
            ParseOutcome::Complete { req, .. } => {
                state.begin(&req, &params, &arena);
                f(&mut state, &arena);
            }
            _ => panic!("test request must parse"),
        }
    }

    #[test]
    fn begin_resets_response_defaults() {
        with_request(b"GET /a HTTP/1.1\r\n\r\n", |state, _| {
            state.status = 500;
            state.push_response_header(b"X-A", b"1");
        });

        with_request(b"GET /b HTTP/1.1\r\n\r\n", |state, _| {
            assert_eq!(state.status, 200);
            assert!(state.response_headers().is_empty());
            assert!(state.response_body().is_empty());
        });
    }

    #[test]
    fn request_header_lookup_is_case_insensitive() {
        with_request(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n", |state, _| {
            let v = state.find_request_header(b"hOsT").expect("header present");
            assert_eq!(unsafe { v.as_bytes() }, b"example");
            assert!(state.find_request_header(b"missing").is_none());
        });
    }

    #[test]
    fn response_header_slots_are_reused() {
        with_request(b"GET / HTTP/1.1\r\n\r\n", |state, _| {
            state.push_response_header(b"X-First", b"old-value");
            state.resp_count = 0;
            state.push_response_header(b"X-Second", b"new");
            assert_eq!(
                state.response_headers(),
                &[("X-Second".to_string(), "new".to_string())]
            );
        });
    }

    #[test]
    fn body_is_copied_into_the_arena() {
        let script_owned = b"transient".to_vec();
        with_request(b"GET / HTTP/1.1\r\n\r\n", |state, _| {
            state.set_body_from(&script_owned);
            let view = state.response_body();
            assert_eq!(unsafe { view.as_bytes() }, b"transient");
            // Distinct storage, not the source slice.
            assert_ne!(
                unsafe { view.as_bytes() }.as_ptr(),
                script_owned.as_ptr()
            );
        });
    }

    #[test]
    fn body_write_without_bound_arena_is_ignored() {
        let mut state = ExchangeState::new();
        state.set_body_from(b"nothing happens");
        assert!(state.response_body().is_empty());
    }
}
