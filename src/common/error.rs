/// The error type for the operations of [`LfHash`][lf-hash] and the primitives
/// it is built from.
///
/// Every mutating step of the table is a single compare-and-swap, so none of
/// these errors leaves the table in a partially updated state.
///
/// [lf-hash]: ./struct.LfHash.html
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The system allocator could not satisfy a request. Only the attempted
    /// operation fails; the table stays consistent.
    #[error("out of memory")]
    OutOfMemory,

    /// An insert into a table configured with unique keys found an element
    /// with an equal key. The table was not modified.
    #[error("an element with an equal key is already present")]
    DuplicateKey,

    /// A delete did not find an element with the given key.
    #[error("no element with the given key was found")]
    NotFound,

    /// The registry already handed out the maximum number of pin sets.
    ///
    /// Pin sets are recycled when a [`Pins`][pins] handle is dropped, so this
    /// only happens when too many handles are alive at the same time.
    ///
    /// [pins]: ./struct.Pins.html
    #[error(
        "too many pin sets are in use at the same time. \
    Drop unused `Pins` handles before acquiring new ones"
    )]
    TooManyPinSets,
}
