//! Client → server operation encoding
//!
//! `PUB`/`HPUB` control lines are built in a reusable scratch buffer with
//! hand-rolled integer formatting, so publishing never allocates once the
//! scratch has grown to fit the longest subject seen.

use bytes::BufMut;

use crate::constants::{buffer, protocol};

/// Largest `usize` rendered in decimal
const MAX_DIGITS: usize = 20;

/// Write `n` as ASCII decimal without going through `fmt`
#[inline]
pub fn put_decimal<B: BufMut>(out: &mut B, mut n: u64) {
    let mut digits = [0u8; MAX_DIGITS];
    let mut pos = MAX_DIGITS;
    loop {
        pos -= 1;
        digits[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    out.put_slice(&digits[pos..]);
}

/// Reusable buffer for publish control lines
#[derive(Debug)]
pub struct ControlLineEncoder {
    scratch: Vec<u8>,
}

impl Default for ControlLineEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlLineEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scratch: Vec::with_capacity(buffer::SCRATCH_INITIAL),
        }
    }

    /// Current scratch capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.scratch.capacity()
    }

    fn prepare(&mut self, subject: &str, reply: Option<&str>) {
        // op + subject + reply + two sizes + separators + CRLF
        let needed = 5 + subject.len() + reply.map_or(0, |r| r.len() + 1) + 2 * (MAX_DIGITS + 1) + 2;
        if self.scratch.capacity() < needed {
            self.scratch = Vec::with_capacity(needed.next_power_of_two());
        }
        self.scratch.clear();
    }

    /// `PUB <subject> [reply] <size>\r\n`
    pub fn pub_line(&mut self, subject: &str, reply: Option<&str>, size: usize) -> &[u8] {
        self.prepare(subject, reply);
        let out = &mut self.scratch;
        out.extend_from_slice(protocol::PUB);
        put_subject_reply(out, subject, reply);
        put_decimal(out, size as u64);
        out.extend_from_slice(protocol::CRLF);
        &self.scratch
    }

    /// `HPUB <subject> [reply] <#hdr> <#total>\r\n`
    pub fn hpub_line(
        &mut self,
        subject: &str,
        reply: Option<&str>,
        header_len: usize,
        total_len: usize,
    ) -> &[u8] {
        self.prepare(subject, reply);
        let out = &mut self.scratch;
        out.extend_from_slice(protocol::HPUB);
        put_subject_reply(out, subject, reply);
        put_decimal(out, header_len as u64);
        out.push(b' ');
        put_decimal(out, total_len as u64);
        out.extend_from_slice(protocol::CRLF);
        &self.scratch
    }
}

#[inline]
fn put_subject_reply(out: &mut Vec<u8>, subject: &str, reply: Option<&str>) {
    out.extend_from_slice(subject.as_bytes());
    out.push(b' ');
    if let Some(reply) = reply.filter(|r| !r.is_empty()) {
        out.extend_from_slice(reply.as_bytes());
        out.push(b' ');
    }
}

/// `SUB <subject> [queue] <sid>\r\n`
pub fn put_sub<B: BufMut>(out: &mut B, subject: &str, queue: Option<&str>, sid: u64) {
    out.put_slice(b"SUB ");
    out.put_slice(subject.as_bytes());
    out.put_u8(b' ');
    if let Some(queue) = queue.filter(|q| !q.is_empty()) {
        out.put_slice(queue.as_bytes());
        out.put_u8(b' ');
    }
    put_decimal(out, sid);
    out.put_slice(protocol::CRLF);
}

/// `UNSUB <sid> [max]\r\n`
pub fn put_unsub<B: BufMut>(out: &mut B, sid: u64, max: Option<u64>) {
    out.put_slice(b"UNSUB ");
    put_decimal(out, sid);
    if let Some(max) = max {
        out.put_u8(b' ');
        put_decimal(out, max);
    }
    out.put_slice(protocol::CRLF);
}
