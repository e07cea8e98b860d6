//! Datatype descriptors, dynamically-typed buffer views, and reduction
//! operators.
//!
//! The engine itself never interprets element contents — that is the
//! reduction-operator collaborator's job — but it does need to know the
//! *shape* of a buffer (element stride, whether it is contiguous, how to
//! pack/unpack it) to fragment sends correctly. This module is the Rust
//! reshaping of the teacher's `DynBuffer`/`DynBufferMut`/`Operation`
//! design with the C ABI (`libffi` closures, raw `MPI_Datatype` handles)
//! stripped out, since the concrete datatype runtime is an external
//! collaborator here.

use std::fmt;
use std::os::raw::c_void;
use std::sync::Arc;

/// Stride, in bytes, between consecutive elements of a datatype.
pub type Extent = usize;

/// Descriptor for a predefined (fixed-layout) datatype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredefinedDatatype {
    /// Stride between elements when packed contiguously.
    pub extent: Extent,
    /// Span from the first byte of the first element to the last byte of
    /// the last element, which may differ from `extent` for datatypes
    /// with internal padding (there are none among the predefined types,
    /// but the field exists for symmetry with user types).
    pub true_extent: Extent,
}

impl PredefinedDatatype {
    /// A tightly-packed type of the given element size (the common case:
    /// `extent == true_extent == size_of::<T>()`).
    pub const fn packed(size: usize) -> Self {
        PredefinedDatatype {
            extent: size,
            true_extent: size,
        }
    }
}

/// Pack/unpack callbacks a user-defined (non-contiguous) datatype must
/// supply so the step executor can stage it into a contiguous buffer
/// before fragmenting.
pub trait UserDatatypeOps: fmt::Debug + Send + Sync {
    /// Extent (stride) of one element.
    fn extent(&self) -> Extent;
    /// True extent, accounting for internal gaps.
    fn true_extent(&self) -> Extent;
    /// Packs `count` elements starting at `src` into `dst`, returning the
    /// number of bytes written.
    fn pack(&self, src: *const c_void, count: usize, dst: &mut [u8]) -> usize;
    /// Unpacks `src` into `count` elements starting at `dst`.
    fn unpack(&self, src: &[u8], count: usize, dst: *mut c_void);
}

/// A datatype descriptor: predefined types carry extents directly, user
/// types expose pack/unpack callbacks and an `is_contiguous` flag.
#[derive(Clone)]
pub enum Datatype {
    /// A predefined type (the common case for HPC collectives).
    Predefined(PredefinedDatatype),
    /// A user-defined type with possibly-noncontiguous layout.
    UserDefined(Arc<dyn UserDatatypeOps>),
}

impl fmt::Debug for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datatype::Predefined(p) => f.debug_tuple("Predefined").field(p).finish(),
            Datatype::UserDefined(_) => f.write_str("UserDefined(..)"),
        }
    }
}

impl Datatype {
    /// Stride between elements.
    pub fn extent(&self) -> Extent {
        match self {
            Datatype::Predefined(p) => p.extent,
            Datatype::UserDefined(u) => u.extent(),
        }
    }

    /// True extent (accounting for internal gaps).
    pub fn true_extent(&self) -> Extent {
        match self {
            Datatype::Predefined(p) => p.true_extent,
            Datatype::UserDefined(u) => u.true_extent(),
        }
    }

    /// Whether the datatype packs contiguously (predefined types always
    /// do; user types declare it explicitly).
    pub fn is_contiguous(&self) -> bool {
        match self {
            Datatype::Predefined(_) => true,
            Datatype::UserDefined(_) => false,
        }
    }
}

/// A dynamically-typed read-only view over `count` elements of `dtype`,
/// passed to reduction callbacks without the caller's static element type.
pub struct DynBuffer<'a> {
    ptr: *const c_void,
    count: usize,
    dtype: &'a Datatype,
}

impl<'a> DynBuffer<'a> {
    /// Builds a view from a raw pointer, element count, and datatype.
    ///
    /// # Safety
    /// `ptr` must be valid for `count * dtype.extent()` bytes for the
    /// lifetime `'a`.
    pub unsafe fn from_raw(ptr: *const c_void, count: usize, dtype: &'a Datatype) -> Self {
        DynBuffer { ptr, count, dtype }
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The buffer's datatype.
    pub fn datatype(&self) -> &Datatype {
        self.dtype
    }

    /// Raw pointer to the first element.
    pub fn as_ptr(&self) -> *const c_void {
        self.ptr
    }

    /// Reinterprets the buffer as a typed slice. Caller vouches that `T`
    /// matches the buffer's datatype.
    ///
    /// # Safety
    /// `T` must have the same layout as `count` contiguous elements of
    /// `self.datatype()`.
    pub unsafe fn as_slice<T>(&self) -> &'a [T] {
        std::slice::from_raw_parts(self.ptr.cast::<T>(), self.count)
    }
}

/// A dynamically-typed mutable view, the reduction target.
pub struct DynBufferMut<'a> {
    ptr: *mut c_void,
    count: usize,
    dtype: &'a Datatype,
}

impl<'a> DynBufferMut<'a> {
    /// Builds a mutable view from a raw pointer, element count, and datatype.
    ///
    /// # Safety
    /// `ptr` must be valid and exclusively borrowed for
    /// `count * dtype.extent()` bytes for the lifetime `'a`.
    pub unsafe fn from_raw(ptr: *mut c_void, count: usize, dtype: &'a Datatype) -> Self {
        DynBufferMut { ptr, count, dtype }
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The buffer's datatype.
    pub fn datatype(&self) -> &Datatype {
        self.dtype
    }

    /// Raw mutable pointer to the first element.
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self.ptr
    }

    /// Reinterprets the buffer as a typed mutable slice. Caller vouches
    /// that `T` matches the buffer's datatype.
    ///
    /// # Safety
    /// `T` must have the same layout as `count` contiguous elements of
    /// `self.datatype()`.
    pub unsafe fn as_mut_slice<T>(&mut self) -> &'a mut [T] {
        std::slice::from_raw_parts_mut(self.ptr.cast::<T>(), self.count)
    }
}

/// An operation used in a reduction or scan, e.g. `MPI_SUM`. The engine
/// never evaluates elements itself — it calls `reduce` and otherwise only
/// consults `is_commutative` to decide whether non-commutative-safe trees
/// are required (see [`crate::plan::trees`]).
pub trait ReductionOperator: fmt::Debug {
    /// Whether swapping the operand order changes the result. Determines
    /// whether the planner must preserve rank order across tree phases.
    fn is_commutative(&self) -> bool;
    /// Applies the operation element-wise: `inoutbuf := f(inbuf, inoutbuf)`.
    fn reduce(&self, inbuf: DynBuffer<'_>, inoutbuf: DynBufferMut<'_>);
}

/// A predefined, commutative, associative operation over one of the
/// built-in numeric element kinds. The concrete arithmetic is provided by
/// the closure at construction — this crate ships the element-kind tag
/// purely so tests and the planner can refer to "the sum operator"
/// without redefining a closure at every call site; production reduction
/// bodies live in the embedder's reduction-backend collaborator.
pub struct SystemOperation<F> {
    name: &'static str,
    function: F,
}

impl<F> fmt::Debug for SystemOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SystemOperation").field(&self.name).finish()
    }
}

impl<F> SystemOperation<F>
where
    F: Fn(DynBuffer<'_>, DynBufferMut<'_>),
{
    /// Wraps a commutative, associative element-wise closure.
    pub fn new(name: &'static str, function: F) -> Self {
        SystemOperation { name, function }
    }
}

impl<F> ReductionOperator for SystemOperation<F>
where
    F: Fn(DynBuffer<'_>, DynBufferMut<'_>),
{
    fn is_commutative(&self) -> bool {
        true
    }

    fn reduce(&self, inbuf: DynBuffer<'_>, inoutbuf: DynBufferMut<'_>) {
        (self.function)(inbuf, inoutbuf)
    }
}

/// A user-defined operation, possibly non-commutative.
pub struct UserOperation<F> {
    commute: bool,
    function: F,
}

impl<F> fmt::Debug for UserOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserOperation")
            .field("commute", &self.commute)
            .finish()
    }
}

impl<F> UserOperation<F>
where
    F: Fn(DynBuffer<'_>, DynBufferMut<'_>),
{
    /// Defines an associative-only (possibly non-commutative) operation.
    pub fn associative(function: F) -> Self {
        Self {
            commute: false,
            function,
        }
    }

    /// Defines an associative and commutative operation.
    pub fn commutative(function: F) -> Self {
        Self {
            commute: true,
            function,
        }
    }
}

impl<F> ReductionOperator for UserOperation<F>
where
    F: Fn(DynBuffer<'_>, DynBufferMut<'_>),
{
    fn is_commutative(&self) -> bool {
        self.commute
    }

    fn reduce(&self, inbuf: DynBuffer<'_>, inoutbuf: DynBufferMut<'_>) {
        (self.function)(inbuf, inoutbuf)
    }
}

/// Builds the predefined integer-sum operator used in tests and as a
/// reference implementation for the allreduce-correctness invariant.
pub fn sum_i32() -> SystemOperation<impl Fn(DynBuffer<'_>, DynBufferMut<'_>)> {
    SystemOperation::new("sum_i32", |inbuf, mut inoutbuf| unsafe {
        let src = inbuf.as_slice::<i32>();
        let dst = inoutbuf.as_mut_slice::<i32>();
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s;
        }
    })
}

/// Builds the predefined `f32` sum operator.
pub fn sum_f32() -> SystemOperation<impl Fn(DynBuffer<'_>, DynBufferMut<'_>)> {
    SystemOperation::new("sum_f32", |inbuf, mut inoutbuf| unsafe {
        let src = inbuf.as_slice::<f32>();
        let dst = inoutbuf.as_mut_slice::<f32>();
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s;
        }
    })
}

/// Performs a local reduction: `inoutbuf := op(inbuf, inoutbuf)`, with no
/// collective communication. Exposed for `MPI_Reduce_local`-style use by
/// the step executor when folding a waypoint's children.
pub fn reduce_local(inbuf: DynBuffer<'_>, inoutbuf: DynBufferMut<'_>, op: &dyn ReductionOperator) {
    op.reduce(inbuf, inoutbuf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_extent_is_packed_size() {
        let dt = PredefinedDatatype::packed(std::mem::size_of::<i32>());
        assert_eq!(dt.extent, 4);
        assert_eq!(dt.true_extent, 4);
    }

    #[test]
    fn sum_i32_reduces_elementwise() {
        let src = [1i32, 2, 3];
        let mut dst = [10i32, 20, 30];
        let dtype = Datatype::Predefined(PredefinedDatatype::packed(4));
        unsafe {
            let inbuf = DynBuffer::from_raw(src.as_ptr().cast(), 3, &dtype);
            let inoutbuf = DynBufferMut::from_raw(dst.as_mut_ptr().cast(), 3, &dtype);
            sum_i32().reduce(inbuf, inoutbuf);
        }
        assert_eq!(dst, [11, 22, 33]);
    }

    #[test]
    fn user_operation_commutativity_is_explicit() {
        let commutative = UserOperation::commutative(|_: DynBuffer<'_>, _: DynBufferMut<'_>| {});
        let associative_only = UserOperation::associative(|_: DynBuffer<'_>, _: DynBufferMut<'_>| {});
        assert!(commutative.is_commutative());
        assert!(!associative_only.is_commutative());
    }
}
