//! Ordered byte flows between two connections.
//!
//! A flow carries everything one source wants to put into one target's
//! output: produced bytes, proxy segments that relay raw input, and frame
//! boundary markers. The engine keeps two flows per backend (towards the
//! backend and towards the frontend) plus one for bytes the frontend's own
//! processor produces.
//!
//! # Data Flow
//! ```text
//! write(bytes) / proxy(len) / inform_frame_ends()
//!     → queue of segments
//!     → transfer(source input, target output)
//!          Bytes  → copied into target output
//!          Proxy  → adopted (zero-copy) or copied from source input
//!     → ProxyComplete → engine calls Processor::proxy_done → finish_proxy
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::net::OutBuffer;
use crate::processor::ProxyDone;

#[derive(Debug)]
enum Segment {
    Bytes { data: Bytes, frame_ends: bool },
    Proxy { remaining: usize, adopted: bool },
    FrameEnds,
}

/// Outcome of one transfer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing queued.
    Idle,
    /// Work queued but the source is empty or the target is full.
    Blocked,
    /// Some bytes moved.
    Progress,
    /// The current proxy segment is fully relayed.
    ProxyComplete,
}

#[derive(Debug)]
pub struct ByteFlow {
    current: Option<Segment>,
    queue: VecDeque<Segment>,
    frame_ends: bool,
    closing: bool,
}

impl Default for ByteFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteFlow {
    pub fn new() -> Self {
        Self {
            current: None,
            queue: VecDeque::new(),
            frame_ends: true,
            closing: false,
        }
    }

    /// The last queued frame has been fully handed to the target.
    pub fn frame_ends(&self) -> bool {
        self.frame_ends
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.is_idle()
    }

    /// Nothing left to hand over: idle, or only an open proxy segment
    /// waiting on an empty source.
    pub fn is_drained(&self, source_empty: bool) -> bool {
        match &self.current {
            None => self.queue.is_empty(),
            Some(Segment::Proxy { .. }) => self.queue.is_empty() && source_empty,
            Some(_) => false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Close the target once everything queued has been handed over.
    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub fn proxy_in_progress(&self) -> bool {
        matches!(self.current, Some(Segment::Proxy { .. }))
            || self.queue.iter().any(|s| matches!(s, Segment::Proxy { .. }))
    }

    /// Queue produced bytes. `frame_ends` marks the end of a frame after them.
    pub fn write(&mut self, data: Bytes, frame_ends: bool) {
        if data.is_empty() {
            if frame_ends {
                self.inform_frame_ends();
            }
            return;
        }
        self.push(Segment::Bytes { data, frame_ends });
    }

    /// Queue a proxy segment. Ignored (returns `false`) while one is already queued.
    pub fn proxy(&mut self, len: usize) -> bool {
        if len == 0 || self.proxy_in_progress() {
            return false;
        }
        self.push(Segment::Proxy {
            remaining: len,
            adopted: false,
        });
        true
    }

    pub fn inform_frame_ends(&mut self) {
        if self.is_idle() {
            self.frame_ends = true;
        } else {
            self.queue.push_back(Segment::FrameEnds);
        }
    }

    /// Apply the processor's answer to a completed proxy segment.
    pub fn finish_proxy(&mut self, done: Option<ProxyDone>) {
        if matches!(self.current, Some(Segment::Proxy { .. })) {
            self.current = None;
        }
        if let Some(done) = done {
            self.frame_ends = done.frame_ends;
        }
        self.poll_queue();
    }

    /// Move bytes from `source` (the input of the connection this flow reads
    /// from) into `target`.
    pub fn transfer(
        &mut self,
        source: &mut BytesMut,
        target: &mut OutBuffer,
        zero_copy_threshold: usize,
    ) -> Step {
        if self.current.is_none() {
            self.poll_queue();
        }
        let Some(segment) = self.current.as_mut() else {
            return Step::Idle;
        };

        match segment {
            Segment::Bytes { data, frame_ends } => {
                if target.free() == 0 {
                    return Step::Blocked;
                }
                target.store(data);
                if data.is_empty() {
                    let ends = *frame_ends;
                    self.current = None;
                    self.frame_ends = ends;
                    self.poll_queue();
                }
                Step::Progress
            }
            Segment::Proxy { remaining, adopted } => {
                if !*adopted && target.is_adoptable() && *remaining > zero_copy_threshold {
                    *adopted = true;
                }
                if *adopted {
                    let n = (*remaining).min(source.len());
                    if n > 0 {
                        target.adopt(source.split_to(n).freeze());
                        *remaining -= n;
                    }
                    if *remaining == 0 && target.adopted_in_flight() == 0 {
                        Step::ProxyComplete
                    } else if n > 0 {
                        Step::Progress
                    } else {
                        Step::Blocked
                    }
                } else {
                    let n = target.copy_from(source, *remaining);
                    *remaining -= n;
                    if *remaining == 0 {
                        Step::ProxyComplete
                    } else if n > 0 {
                        Step::Progress
                    } else {
                        Step::Blocked
                    }
                }
            }
            Segment::FrameEnds => {
                self.current = None;
                self.frame_ends = true;
                self.poll_queue();
                Step::Progress
            }
        }
    }

    fn push(&mut self, segment: Segment) {
        self.frame_ends = false;
        if self.current.is_none() && self.queue.is_empty() {
            self.current = Some(segment);
        } else {
            self.queue.push_back(segment);
        }
    }

    fn poll_queue(&mut self) {
        if self.current.is_some() {
            return;
        }
        while let Some(segment) = self.queue.pop_front() {
            match segment {
                Segment::FrameEnds => {
                    self.frame_ends = true;
                }
                other => {
                    self.frame_ends = false;
                    self.current = Some(other);
                    return;
                }
            }
        }
    }
}
