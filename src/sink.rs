//! Response writing.
//!
//! [`CacheableResponse`] wraps an outbound transport and mirrors every chunk
//! into the buffers of the cache frames currently open on it. A frame is
//! opened per cache handle; nested frames capture response parts, and a
//! chunk written while several frames are open lands in all of them, so a
//! parent entry's body always embeds its children's bytes.

use bytes::{Bytes, BytesMut};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

use std::sync::{Arc, Mutex};

use crate::entry::CachedEntry;
use crate::handle::CacheHandle;
use crate::lock::mutex_lock;
use crate::producer::WritePermit;

const SOURCE: &str = "sink";

/// Destination of the rendered response, typically the HTTP connection.
///
/// The head is sent exactly once, before the first body chunk.
pub trait Transport: Send {
    fn begin(&mut self, status: u16, headers: &[(String, String)]);
    fn write(&mut self, chunk: &[u8]);
}

/// In-memory transport, for tests and offline rendering.
///
/// Clones share the same buffers, so a caller can hand one clone to the
/// response and inspect the output through another.
#[derive(Debug, Clone, Default)]
pub struct BufferedTransport {
    inner: Arc<Mutex<BufferedOutput>>,
}

#[derive(Debug, Default)]
struct BufferedOutput {
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
}

impl BufferedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        mutex_lock(&self.inner, SOURCE, "status").status
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        mutex_lock(&self.inner, SOURCE, "headers").headers.clone()
    }

    pub fn body(&self) -> Bytes {
        mutex_lock(&self.inner, SOURCE, "body")
            .body
            .clone()
            .freeze()
    }
}

impl Transport for BufferedTransport {
    fn begin(&mut self, status: u16, headers: &[(String, String)]) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "begin");
        inner.status = status;
        inner.headers = headers.to_vec();
    }

    fn write(&mut self, chunk: &[u8]) {
        mutex_lock(&self.inner, SOURCE, "write")
            .body
            .extend_from_slice(chunk);
    }
}

/// One open cache capture: everything written while the frame is on the
/// stack becomes the body of the entry published under its handle.
pub(crate) struct Frame {
    handle: Arc<CacheHandle>,
    buffer: BytesMut,
    children: Vec<String>,
    permit: Option<WritePermit>,
    store: bool,
}

impl Frame {
    pub(crate) fn handle(&self) -> &Arc<CacheHandle> {
        &self.handle
    }

    pub(crate) fn take_permit(&mut self) -> Option<WritePermit> {
        self.permit.take()
    }

    pub(crate) fn store(&self) -> bool {
        self.store
    }

    pub(crate) fn body(&self) -> Bytes {
        self.buffer.clone().freeze()
    }

    pub(crate) fn children(&self) -> &[String] {
        &self.children
    }
}

/// A response that is being rendered and captured at the same time.
pub struct CacheableResponse {
    site: String,
    transport: Box<dyn Transport>,
    frames: Vec<Frame>,
    status: u16,
    headers: Vec<(String, String)>,
    modified: Option<OffsetDateTime>,
    head_sent: bool,
    invalidated: bool,
}

impl CacheableResponse {
    pub(crate) fn new(site: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            site: site.into(),
            transport,
            frames: Vec::new(),
            status: 200,
            headers: Vec::new(),
            modified: None,
            head_sent: false,
            invalidated: false,
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    /// Set the response status. Ignored once the head has been sent.
    pub fn set_status(&mut self, status: u16) {
        if !self.head_sent {
            self.status = status;
        }
    }

    /// Add a response header. Ignored once the head has been sent.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if !self.head_sent {
            self.headers.push((name.into(), value.into()));
        }
    }

    /// Record the modification date of the rendered content. Stored with
    /// the entry and emitted as a `Last-Modified` header.
    pub fn set_modified(&mut self, modified: OffsetDateTime) {
        match self.modified {
            Some(current) if current >= modified => {}
            _ => self.modified = Some(modified),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn modified(&self) -> Option<OffsetDateTime> {
        self.modified
    }

    /// Write a body chunk. The head is sent on the first chunk; the chunk
    /// goes to the transport and to every open frame.
    pub fn write(&mut self, chunk: &[u8]) {
        self.send_head();
        self.transport.write(chunk);
        for frame in &mut self.frames {
            frame.buffer.extend_from_slice(chunk);
        }
    }

    /// Mark the in-flight response invalid: everything captured so far is
    /// discarded and no frame on this response will be stored. Rendering
    /// continues uncached.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
        for frame in &mut self.frames {
            frame.store = false;
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn top_handle(&self) -> Option<&Arc<CacheHandle>> {
        self.frames.last().map(Frame::handle)
    }

    pub(crate) fn push_frame(
        &mut self,
        handle: Arc<CacheHandle>,
        permit: Option<WritePermit>,
        store: bool,
    ) {
        let store = store && !self.invalidated;
        self.frames.push(Frame {
            handle,
            buffer: BytesMut::new(),
            children: Vec::new(),
            permit,
            store,
        });
    }

    pub(crate) fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Record that a nested entry's bytes were embedded in every open frame.
    pub(crate) fn record_child(&mut self, key: &str) {
        for frame in &mut self.frames {
            if !frame.children.iter().any(|c| c == key) {
                frame.children.push(key.to_string());
            }
        }
    }

    /// Replay a cached whole response: its status, headers and body.
    pub(crate) fn serve_response(&mut self, entry: &CachedEntry) {
        self.status = entry.status();
        self.headers = entry.headers().to_vec();
        if let Some(modified) = entry.modified() {
            self.modified = Some(modified);
        }
        self.write(entry.body());
    }

    /// Replay a cached response part into the surrounding response.
    pub(crate) fn serve_part(&mut self, entry: &CachedEntry) {
        self.record_child(entry.key());
        for child in entry.children() {
            self.record_child(child);
        }
        self.write(entry.body());
    }

    fn send_head(&mut self) {
        if self.head_sent {
            return;
        }
        self.head_sent = true;
        if let Some(modified) = self.modified {
            let already_set = self
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("last-modified"));
            if !already_set {
                if let Ok(value) = modified.format(&Rfc2822) {
                    self.headers.push(("Last-Modified".to_string(), value));
                }
            }
        }
        self.transport.begin(self.status, &self.headers);
    }
}
