use std::ops::Range;

use crate::program::INSTRUCTION_SIZE;

/// Words in one trigger message: the uniforms address then the code address.
pub const MESSAGE_WORDS: usize = 2;

/// A byte range inside the composite job region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Offset from the start of the region, in bytes.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
}

impl Span {
    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// The span as a range, for slicing the region bytes.
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    /// Returns true if the two spans share at least one byte.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Returns the `index`-th of the equal slots of `slot_len` bytes this span is made of.
    fn slot(&self, index: usize, slot_len: usize) -> Span {
        let slot = Span {
            offset: self.offset + index * slot_len,
            len: slot_len,
        };
        debug_assert!(slot.end() <= self.end());
        slot
    }
}

/// The plan of the single shared-memory region one dispatch uses.
///
/// The region holds, in order, one trigger message per worker, the program code, one
/// parameter table per worker and one scratch area per worker. Every span starts on a
/// word boundary, and per-worker slots never overlap, so each worker only ever writes
/// memory it owns.
///
/// # Example
///
/// ```
/// use qpu_blas::JobLayout;
///
/// let layout = JobLayout::plan(12, 64, 15, 16);
/// assert_eq!(layout.messages.len, 12 * 8);
/// assert_eq!(layout.uniforms_for(1).offset, layout.uniforms.offset + 60);
/// assert!(layout.is_consistent());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLayout {
    /// Number of workers the region is planned for.
    pub worker_count: usize,
    /// Trigger messages.
    pub messages: Span,
    /// Program code.
    pub code: Span,
    /// Parameter tables.
    pub uniforms: Span,
    /// Scratch areas.
    pub scratch: Span,
    uniform_words: usize,
    scratch_words: usize,
}

impl JobLayout {
    /// Plans the region for `worker_count` workers.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero.
    pub fn plan(
        worker_count: usize,
        code_size: usize,
        uniform_words: usize,
        scratch_words: usize,
    ) -> Self {
        assert!(worker_count > 0, "A dispatch needs at least one worker");
        let messages = Span {
            offset: 0,
            len: worker_count * MESSAGE_WORDS * 4,
        };
        let code = Span {
            offset: messages.end(),
            len: code_size,
        };
        let uniforms = Span {
            offset: code.end().next_multiple_of(INSTRUCTION_SIZE),
            len: worker_count * uniform_words * 4,
        };
        let scratch = Span {
            offset: uniforms.end(),
            len: worker_count * scratch_words * 4,
        };
        Self {
            worker_count,
            messages,
            code,
            uniforms,
            scratch,
            uniform_words,
            scratch_words,
        }
    }

    /// Size of the whole region in bytes.
    pub fn total_size(&self) -> usize {
        self.scratch.end()
    }

    /// Words in each parameter table.
    pub fn uniform_words(&self) -> usize {
        self.uniform_words
    }

    /// Words in each scratch area.
    pub fn scratch_words(&self) -> usize {
        self.scratch_words
    }

    /// The trigger message of `worker`.
    pub fn message(&self, worker: usize) -> Span {
        self.check_worker(worker);
        self.messages.slot(worker, MESSAGE_WORDS * 4)
    }

    /// The parameter table of `worker`.
    pub fn uniforms_for(&self, worker: usize) -> Span {
        self.check_worker(worker);
        self.uniforms.slot(worker, self.uniform_words * 4)
    }

    /// The scratch area of `worker`.
    pub fn scratch_for(&self, worker: usize) -> Span {
        self.check_worker(worker);
        self.scratch.slot(worker, self.scratch_words * 4)
    }

    /// Returns true if the sections are word aligned, disjoint and inside the region.
    pub fn is_consistent(&self) -> bool {
        let sections = [self.messages, self.code, self.uniforms, self.scratch];
        let aligned = sections.iter().all(|s| s.offset % 4 == 0);
        let inside = sections.iter().all(|s| s.end() <= self.total_size());
        let disjoint = sections.iter().enumerate().all(|(i, a)| {
            sections[i + 1..]
                .iter()
                .all(|b| a.len == 0 || b.len == 0 || !a.overlaps(b))
        });
        aligned && inside && disjoint
    }

    fn check_worker(&self, worker: usize) {
        assert!(
            worker < self.worker_count,
            "Worker {worker} out of range for {} workers",
            self.worker_count
        );
    }
}
