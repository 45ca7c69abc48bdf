//! Adapts a live upstream SSE body into a `Read` the HTTP layer can hand
//! straight to `tiny_http` as a chunked response body: each `read()` pulls
//! fresh upstream bytes only when nothing translated is buffered yet, so
//! frames reach the client as soon as the bridge produces them.

use std::collections::VecDeque;
use std::io::{self, Read};

use crate::bridge::LiveReplyTranslator;

pub(super) struct LiveStream {
    upstream: reqwest::blocking::Response,
    translator: LiveReplyTranslator,
    pending: VecDeque<u8>,
    upstream_done: bool,
}

impl LiveStream {
    pub(super) fn new(upstream: reqwest::blocking::Response, translator: LiveReplyTranslator) -> Self {
        Self { upstream, translator, pending: VecDeque::new(), upstream_done: false }
    }

    pub(super) fn translator(&self) -> &LiveReplyTranslator {
        &self.translator
    }

    fn push_frames(&mut self, frames: Vec<String>) {
        for frame in frames {
            self.pending.extend(frame.into_bytes());
        }
    }
}

impl Read for LiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                for (dst, src) in buf[..n].iter_mut().zip(self.pending.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if self.upstream_done {
                return Ok(0);
            }
            let mut chunk = [0u8; 8192];
            let read = self.upstream.read(&mut chunk)?;
            if read == 0 {
                self.upstream_done = true;
                let frames = self.translator.finish();
                self.push_frames(frames);
                continue;
            }
            let frames = self.translator.push(&chunk[..read]);
            self.push_frames(frames);
        }
    }
}
