use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::HeaderMap;
use micro_exchange::callback::Callback;
use micro_exchange::protocol::{Content, Failure, ResponseMeta};
use micro_exchange::stream::HttpStream;

#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    payload: Payload,
}

impl TestCase {
    pub fn new(name: &'static str, group: TestGroup, payload: Payload) -> Self {
        Self { name, group, payload }
    }

    pub fn small(name: &'static str, payload: Payload) -> Self {
        Self::new(name, TestGroup::Small, payload)
    }

    pub fn normal(name: &'static str, payload: Payload) -> Self {
        Self::new(name, TestGroup::Normal, payload)
    }

    pub fn large(name: &'static str, payload: Payload) -> Self {
        Self::new(name, TestGroup::Large, payload)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// A response body written as `chunks` writes of `chunk_size` bytes.
#[derive(Debug, Copy, Clone)]
pub struct Payload {
    chunks: usize,
    chunk_size: usize,
}

impl Payload {
    pub const fn new(chunks: usize, chunk_size: usize) -> Self {
        Self { chunks, chunk_size }
    }

    pub fn total_len(&self) -> u64 {
        (self.chunks * self.chunk_size) as u64
    }

    pub fn to_chunks(&self) -> Vec<Bytes> {
        let chunk = Bytes::from(vec![b'x'; self.chunk_size]);
        (0..self.chunks).map(|_| chunk.clone()).collect()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Normal,
    Large,
}

/// A stream that discards everything and completes every send on the spot.
#[derive(Debug, Default)]
pub struct NullStream {
    committed: AtomicBool,
    succeeded: AtomicBool,
}

impl NullStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Acquire)
    }
}

impl HttpStream for NullStream {
    fn id(&self) -> String {
        "1".to_string()
    }

    fn read_content(&self) -> Option<Content> {
        Some(Content::eof())
    }

    fn demand_content(&self) {}

    fn prepare_response(&self, _headers: &mut HeaderMap) {}

    fn send(&self, response: Option<ResponseMeta>, _last: bool, callback: Callback, content: Vec<Bytes>) {
        if response.is_some() {
            self.committed.store(true, Ordering::Release);
        }
        std::hint::black_box(content);
        callback.succeeded();
    }

    fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    fn consume_all(&self) -> Option<Failure> {
        None
    }

    fn succeeded(&self) {
        self.succeeded.store(true, Ordering::Release);
    }

    fn failed(&self, _cause: Failure) {}
}
