//! Feature buffers: the only owners of raw sample memory in the crate.
//!
//! # Core Buffer Types
//!
//! - [`FeatureMap`]: one rectangular `height × width` plane of samples, row-major.
//! - [`FeatureStack`]: an ordered list of equally shaped planes, one per channel.
//! - [`Flattened`]: a 1-D feature vector that remembers how it was flattened.
//!
//! ## Design Highlights
//! - Dimensions are checked on construction: both extents are positive and the
//!   data length matches exactly. There is no implicit padding or resizing.
//! - Buffers are moved from stage to stage; nothing here is reference counted.
//! - Allocation goes through `try_reserve_exact`, so running out of memory is
//!   reported as [`Error::Allocation`] instead of aborting the process.
//! - The [`feature_map!`](crate::feature_map) macro builds small planes from
//!   nested literals for tests and examples.
//!
//! ## Example
//!
//! ```rust
//! use pico_cnn::tensors::FeatureMap;
//! let m = FeatureMap::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! assert_eq!(m.get(1, 2), Some(6.0));
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The float used in every buffer (`f32`).
pub type TensorFloat = f32;

/// Height and width of one feature plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape2 {
    /// Number of rows.
    pub height: usize,
    /// Number of columns.
    pub width: usize,
}

impl Shape2 {
    /// Creates a shape without validating it.
    #[must_use]
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Number of samples in a plane of this shape.
    #[must_use]
    pub const fn len(self) -> usize {
        self.height * self.width
    }

    /// `true` if either extent is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.height == 0 || self.width == 0
    }
}

impl fmt::Display for Shape2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Allocates a buffer of `len` copies of `value`, reporting allocation failure
/// instead of aborting.
pub(crate) fn alloc_buffer(
    what: &'static str,
    len: usize,
    value: TensorFloat,
) -> Result<Vec<TensorFloat>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::Allocation {
        what,
        bytes: len.saturating_mul(size_of::<TensorFloat>()),
    })?;
    buf.resize(len, value);
    Ok(buf)
}

/// One rectangular plane of real-valued samples in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    shape: Shape2,
    data: Vec<TensorFloat>,
}

impl FeatureMap {
    /// Wraps `data` as a `height × width` plane.
    ///
    /// # Errors
    /// [`Error::InvalidShape`] if an extent is zero or `data.len() != height * width`.
    pub fn new(height: usize, width: usize, data: Vec<TensorFloat>) -> Result<Self> {
        let shape = Shape2::new(height, width);
        if shape.is_empty() || height.checked_mul(width) != Some(data.len()) {
            return Err(Error::InvalidShape {
                op: "feature_map",
                height,
                width,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// A plane with every sample set to `value`.
    ///
    /// # Errors
    /// [`Error::InvalidShape`] for a zero extent, [`Error::Allocation`] if memory runs out.
    pub fn filled(height: usize, width: usize, value: TensorFloat) -> Result<Self> {
        let len = height.checked_mul(width).unwrap_or(0);
        if len == 0 {
            return Err(Error::InvalidShape {
                op: "feature_map",
                height,
                width,
                len: 0,
            });
        }
        let data = alloc_buffer("feature map", len, value)?;
        Ok(Self {
            shape: Shape2::new(height, width),
            data,
        })
    }

    /// A plane of zeros.
    ///
    /// # Errors
    /// Same as [`FeatureMap::filled`].
    pub fn zeros(height: usize, width: usize) -> Result<Self> {
        Self::filled(height, width, 0.0)
    }

    /// Builds a plane from equally long rows.
    ///
    /// # Errors
    /// [`Error::InvalidShape`] for empty input or ragged rows.
    pub fn from_rows(rows: &[Vec<TensorFloat>]) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(Error::InvalidShape {
                op: "feature_map",
                height,
                width,
                len: bad.len(),
            });
        }
        Self::new(height, width, rows.concat())
    }

    /// Plane shape.
    #[must_use]
    pub const fn shape(&self) -> Shape2 {
        self.shape
    }

    /// Number of rows.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.shape.height
    }

    /// Number of columns.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.shape.width
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; a plane cannot be constructed empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row-major samples.
    #[must_use]
    pub fn data(&self) -> &[TensorFloat] {
        &self.data
    }

    /// Mutable row-major samples.
    pub fn data_mut(&mut self) -> &mut [TensorFloat] {
        &mut self.data
    }

    /// Row `y` as a slice.
    #[must_use]
    pub fn row(&self, y: usize) -> &[TensorFloat] {
        let w = self.shape.width;
        &self.data[y * w..(y + 1) * w]
    }

    /// Sample at `(y, x)`, or `None` outside the plane.
    #[must_use]
    pub fn get(&self, y: usize, x: usize) -> Option<TensorFloat> {
        if y < self.shape.height && x < self.shape.width {
            Some(self.data[y * self.shape.width + x])
        } else {
            None
        }
    }

    /// Consumes the plane, returning its samples.
    #[must_use]
    pub fn into_vec(self) -> Vec<TensorFloat> {
        self.data
    }
}

/// How a channel stack is laid out when flattened into a vector.
///
/// A dense layer's weight columns follow exactly one of these orders; feeding it
/// a vector flattened the other way is rejected instead of silently producing
/// wrong scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlattenOrder {
    /// `(channel, row, column)`: every channel's plane one after another.
    #[default]
    ChannelMajor,
    /// `(row, column, channel)`: all channels of one position are adjacent.
    Interleaved,
}

impl fmt::Display for FlattenOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelMajor => f.write_str("channel-major"),
            Self::Interleaved => f.write_str("interleaved"),
        }
    }
}

/// A 1-D feature vector plus the layout it was flattened from.
///
/// `order` is `None` when the vector never had a spatial layout (for example the
/// output of a previous dense stage); such vectors are accepted by any dense layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Flattened {
    data: Vec<TensorFloat>,
    order: Option<FlattenOrder>,
}

impl Flattened {
    /// A plain vector without spatial layout.
    #[must_use]
    pub const fn vector(data: Vec<TensorFloat>) -> Self {
        Self { data, order: None }
    }

    /// A vector that was flattened from a stack in `order`.
    #[must_use]
    pub const fn with_order(data: Vec<TensorFloat>, order: FlattenOrder) -> Self {
        Self {
            data,
            order: Some(order),
        }
    }

    /// Layout the vector came from, if any.
    #[must_use]
    pub const fn order(&self) -> Option<FlattenOrder> {
        self.order
    }

    /// Samples.
    #[must_use]
    pub fn data(&self) -> &[TensorFloat] {
        &self.data
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` for an empty vector.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the vector, returning its samples.
    #[must_use]
    pub fn into_vec(self) -> Vec<TensorFloat> {
        self.data
    }
}

/// An ordered list of equally shaped feature planes, one per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStack {
    shape: Shape2,
    channels: Vec<FeatureMap>,
}

impl FeatureStack {
    /// Stacks `channels`.
    ///
    /// # Errors
    /// [`Error::InvalidShape`] for an empty list, [`Error::ShapeMismatch`] if the
    /// planes differ in shape.
    pub fn new(channels: Vec<FeatureMap>) -> Result<Self> {
        let Some(first) = channels.first() else {
            return Err(Error::InvalidShape {
                op: "feature_stack",
                height: 0,
                width: 0,
                len: 0,
            });
        };
        let shape = first.shape();
        if let Some(bad) = channels.iter().find(|c| c.shape() != shape) {
            return Err(Error::ShapeMismatch {
                op: "feature_stack",
                expected: shape.to_string(),
                got: bad.shape().to_string(),
            });
        }
        Ok(Self { shape, channels })
    }

    /// A one-channel stack.
    #[must_use]
    pub fn single(map: FeatureMap) -> Self {
        Self {
            shape: map.shape(),
            channels: vec![map],
        }
    }

    /// Shape shared by every channel.
    #[must_use]
    pub const fn map_shape(&self) -> Shape2 {
        self.shape
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always `false`; a stack holds at least one channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// All channels in order.
    #[must_use]
    pub fn channels(&self) -> &[FeatureMap] {
        &self.channels
    }

    /// Channel `index`, if present.
    #[must_use]
    pub fn channel(&self, index: usize) -> Option<&FeatureMap> {
        self.channels.get(index)
    }

    /// Consumes the stack, returning its channels.
    #[must_use]
    pub fn into_channels(self) -> Vec<FeatureMap> {
        self.channels
    }

    /// Flattens every channel into one vector in the given `order`.
    ///
    /// # Errors
    /// [`Error::Allocation`] if the output cannot be allocated.
    pub fn flatten(&self, order: FlattenOrder) -> Result<Flattened> {
        let plane = self.shape.len();
        let count = self.channels.len();
        let mut out = alloc_buffer("flattened features", plane * count, 0.0)?;
        match order {
            FlattenOrder::ChannelMajor => {
                for (dst, channel) in out.chunks_exact_mut(plane).zip(&self.channels) {
                    dst.copy_from_slice(channel.data());
                }
            }
            FlattenOrder::Interleaved => {
                for (c, channel) in self.channels.iter().enumerate() {
                    for (i, &v) in channel.data().iter().enumerate() {
                        out[i * count + c] = v;
                    }
                }
            }
        }
        Ok(Flattened::with_order(out, order))
    }
}

/// Defines a [`FeatureMap`] from nested literal rows.
///
/// Rows must all have the same length.
///
/// # Example
/// ```
/// use pico_cnn::feature_map;
/// let m = feature_map!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(m.height(), 2);
/// ```
#[macro_export]
macro_rules! feature_map {
    ([ $( [ $( $x:expr ),+ $(,)? ] ),+ $(,)? ]) => {{
        let rows: ::std::vec::Vec<::std::vec::Vec<$crate::tensors::TensorFloat>> =
            ::std::vec![ $( ::std::vec![ $( $x as $crate::tensors::TensorFloat ),+ ] ),+ ];
        match $crate::tensors::FeatureMap::from_rows(&rows) {
            Ok(map) => map,
            Err(e) => panic!("ragged feature map literal: {e}"),
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_length() {
        let err = FeatureMap::new(2, 2, vec![1.0; 3]).unwrap_err();
        assert!(err.is_shape_error());
    }

    #[test]
    fn rejects_zero_extent() {
        assert!(FeatureMap::new(0, 4, vec![]).is_err());
        assert!(FeatureMap::zeros(3, 0).is_err());
    }

    #[test]
    fn macro_builds_row_major_plane() {
        let m = feature_map!([[1, 2, 3], [4, 5, 6]]);
        assert_eq!(m.shape(), Shape2::new(2, 3));
        assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn stack_requires_equal_shapes() {
        let a = FeatureMap::zeros(2, 2).unwrap();
        let b = FeatureMap::zeros(3, 2).unwrap();
        assert!(FeatureStack::new(vec![a, b]).is_err());
        assert!(FeatureStack::new(vec![]).is_err());
    }

    #[test]
    fn flatten_orders_differ() {
        let a = feature_map!([[1, 2], [3, 4]]);
        let b = feature_map!([[10, 20], [30, 40]]);
        let stack = FeatureStack::new(vec![a, b]).unwrap();

        let cm = stack.flatten(FlattenOrder::ChannelMajor).unwrap();
        assert_eq!(cm.data(), &[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]);
        assert_eq!(cm.order(), Some(FlattenOrder::ChannelMajor));

        let il = stack.flatten(FlattenOrder::Interleaved).unwrap();
        assert_eq!(il.data(), &[1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
    }
}
