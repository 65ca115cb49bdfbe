use thiserror::Error;

/// Errors surfaced at the `FlaggedArraySet` construction boundary.
///
/// Like [`relay_compress::CompressError`](../../relay_compress/enum.CompressError.html),
/// these are recoverable, caller-facing conditions, not the
/// `assert!`/`debug_assert!`-guarded programming-invariant violations the
/// set's internals use for its own bookkeeping (offset arithmetic, slot
/// renumbering).
#[derive(Debug, Error)]
pub enum FasError {
    #[error("FlaggedArraySet capacity must be nonzero")]
    ZeroCapacity,
    #[error("payload too short to hash: {0} bytes")]
    PayloadTooShort(usize),
}
