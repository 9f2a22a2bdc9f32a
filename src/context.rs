//! Recording toggle and tape.
//!
//! This module holds the two pieces of mutable state the graph operations
//! consult: whether recording is enabled, and the tape that keeps every
//! recorded tensor alive until the next iteration boundary.
//!
//! # Lifetime Model
//!
//! Graph edges point from child to parent through `Weak` references, so an
//! intermediate result that the caller drops would vanish before `backward`
//! reaches it. The tape holds a strong handle to every tensor produced while
//! recording, plus the leaf operands those operations read, and [`clear_tape`]
//! releases them all at once. Training loops call
//! it at the start of each iteration.
//!
//! # Scope
//!
//! State lives in a [`GraphContext`] owned by the current thread. Tensors are
//! `!Send`, so a graph can never span threads, and separate threads (including
//! separate test threads) get independent contexts. Within one thread only one
//! recording episode should be active at a time.

use std::cell::{Cell, RefCell};

use crate::tensors::Tensor;

/// Recording flag and tape for one thread.
pub struct GraphContext {
    recording: Cell<bool>,
    tape: RefCell<Vec<Tensor>>,
}

impl GraphContext {
    /// A context with recording enabled and an empty tape.
    #[must_use]
    pub fn new() -> Self {
        Self {
            recording: Cell::new(true),
            tape: RefCell::new(Vec::new()),
        }
    }

    /// Whether graph operations attach edges.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.get()
    }

    /// Enables or disables recording.
    pub fn set_recording(&self, enabled: bool) {
        self.recording.set(enabled);
    }

    /// Appends a strong handle to the tape.
    pub fn register(&self, tensor: &Tensor) {
        self.tape.borrow_mut().push(tensor.clone());
    }

    /// Number of tensors currently held by the tape.
    #[must_use]
    pub fn tape_len(&self) -> usize {
        self.tape.borrow().len()
    }

    /// Releases every handle held by the tape.
    pub fn clear_tape(&self) {
        let released = std::mem::take(&mut *self.tape.borrow_mut());
        tracing::trace!(released = released.len(), "tape cleared");
        drop(released);
    }

    /// Clears the tape and re-enables recording.
    pub fn reset(&self) {
        self.clear_tape();
        self.set_recording(true);
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CONTEXT: GraphContext = GraphContext::new();
}

/// Runs `f` against the current thread's context.
pub fn with_context<R>(f: impl FnOnce(&GraphContext) -> R) -> R {
    CONTEXT.with(f)
}

/// Whether graph operations on this thread attach edges. Defaults to `true`.
#[must_use]
pub fn is_recording() -> bool {
    with_context(GraphContext::is_recording)
}

/// Enables or disables recording on this thread.
///
/// # Example
///
/// ```
/// use mlscript::context::{is_recording, set_recording};
/// set_recording(false);
/// assert!(!is_recording());
/// set_recording(true);
/// ```
pub fn set_recording(enabled: bool) {
    with_context(|ctx| ctx.set_recording(enabled));
}

/// Keeps `tensor` alive until the next [`clear_tape`].
pub fn register(tensor: &Tensor) {
    with_context(|ctx| ctx.register(tensor));
}

/// Number of tensors held by this thread's tape.
#[must_use]
pub fn tape_len() -> usize {
    with_context(GraphContext::tape_len)
}

/// Releases every tensor held by this thread's tape.
pub fn clear_tape() {
    with_context(GraphContext::clear_tape);
}

/// Clears the tape and re-enables recording.
pub fn reset() {
    with_context(GraphContext::reset);
}

/// Disables recording until the returned guard is dropped.
///
/// The previous state is restored on drop, so guards nest.
///
/// # Example
///
/// ```
/// use mlscript::context::{is_recording, no_grad};
/// {
///     let _guard = no_grad();
///     assert!(!is_recording());
/// }
/// assert!(is_recording());
/// ```
#[must_use = "recording is re-enabled as soon as the guard is dropped"]
pub fn no_grad() -> NoGradGuard {
    let previous = is_recording();
    set_recording(false);
    NoGradGuard { previous }
}

/// Restores the recording state captured by [`no_grad`].
pub struct NoGradGuard {
    previous: bool,
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_recording(self.previous);
    }
}
