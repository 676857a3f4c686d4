use crate::{
    collation::{BinaryCollation, Collation},
    common::error::Error,
};

use super::{node::KeyLayout, LfHash, MAX_BUCKETS};

/// Builds an [`LfHash`][lf-hash] with various configuration knobs.
///
/// Unless configured otherwise, the whole element is the key, keys are unique,
/// compared byte-wise, and the table starts with one bucket and doubles its
/// bucket count whenever it holds more elements than buckets.
///
/// [lf-hash]: ./struct.LfHash.html
///
/// # Examples
///
/// ```rust
/// use lfhash::{AsciiCaseInsensitive, LfHashBuilder};
///
/// // 16-byte elements keyed by their first 8 bytes, case-insensitively.
/// let table = LfHashBuilder::new(16)
///     .key(0, 8)
///     .collation(AsciiCaseInsensitive)
///     // Expect around 1,000 elements.
///     .initial_buckets(1_000)
///     .build()
///     .unwrap();
///
/// assert_eq!(table.bucket_count(), 1_024);
/// ```
///
pub struct LfHashBuilder<C> {
    element_size: usize,
    key_layout: Option<KeyLayout>,
    unique: bool,
    initial_buckets: u32,
    max_load: f64,
    collation: C,
}

impl LfHashBuilder<BinaryCollation> {
    /// Construct a new `LfHashBuilder` for a table of elements of
    /// `element_size` bytes.
    pub fn new(element_size: usize) -> Self {
        Self {
            element_size,
            key_layout: None,
            unique: true,
            initial_buckets: 1,
            max_load: 1.0,
            collation: BinaryCollation,
        }
    }
}

impl<C: Collation> LfHashBuilder<C> {
    /// Builds an `LfHash<C>`.
    ///
    /// # Panics
    ///
    /// Panics if the configured key is empty or does not fit in the element.
    pub fn build(self) -> Result<LfHash<C>, Error> {
        let key_layout = self.key_layout.unwrap_or(KeyLayout::Fixed {
            offset: 0,
            len: self.element_size,
        });
        if let KeyLayout::Fixed { offset, len } = key_layout {
            assert!(len > 0, "the key must not be empty");
            assert!(
                offset
                    .checked_add(len)
                    .map_or(false, |end| end <= self.element_size),
                "the key must fit in the element"
            );
        }

        LfHash::with_everything(
            self.element_size,
            key_layout,
            self.unique,
            self.initial_buckets,
            self.max_load,
            self.collation,
        )
    }

    /// Sets the key to the `len` bytes at `offset` of each element.
    pub fn key(self, offset: usize, len: usize) -> Self {
        Self {
            key_layout: Some(KeyLayout::Fixed { offset, len }),
            ..self
        }
    }

    /// Sets a function that returns the key of an element. The returned slice
    /// must be part of the element.
    pub fn key_extractor(self, extract: fn(&[u8]) -> &[u8]) -> Self {
        Self {
            key_layout: Some(KeyLayout::Extract(extract)),
            ..self
        }
    }

    /// Sets whether an insert of an element with a key already present fails
    /// with `Error::DuplicateKey` (`true`, the default) or adds the element
    /// next to the others.
    pub fn unique(self, unique: bool) -> Self {
        Self { unique, ..self }
    }

    /// Sets the initial number of buckets, rounded up to a power of two.
    pub fn initial_buckets(self, buckets: u32) -> Self {
        let buckets = buckets.clamp(1, MAX_BUCKETS).next_power_of_two();
        Self {
            initial_buckets: buckets,
            ..self
        }
    }

    /// Sets the average number of elements per bucket above which the bucket
    /// count doubles.
    ///
    /// # Panics
    ///
    /// Panics if `max_load` is not a positive number.
    pub fn max_load(self, max_load: f64) -> Self {
        assert!(max_load > 0.0, "max_load must be a positive number");
        Self { max_load, ..self }
    }

    /// Sets the collation that hashes and compares keys.
    pub fn collation<D: Collation>(self, collation: D) -> LfHashBuilder<D> {
        LfHashBuilder {
            element_size: self.element_size,
            key_layout: self.key_layout,
            unique: self.unique,
            initial_buckets: self.initial_buckets,
            max_load: self.max_load,
            collation,
        }
    }
}
